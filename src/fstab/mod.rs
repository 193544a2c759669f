//! Mount table parsing, as written by the installed system's tooling.
//!
//! Fields are whitespace separated: `spec mountpoint type options [dump [pass]]`.
//! `#` starts a comment line; blank lines are ignored. Spaces inside a
//! field are written as octal escapes (`\040`).

pub mod crypttab;

pub use crypttab::{parse_crypttab, CryptEntry};

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::Path;

pub const NOAUTO: &str = "noauto";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTableEntry {
    pub spec: String,
    pub mountpoint: String,
    pub fstype: String,
    /// Ordered, without duplicates.
    pub options: Vec<String>,
    pub dump: Option<u32>,
    pub pass: Option<u32>,
}

impl MountTableEntry {
    pub fn new(spec: &str, mountpoint: &str, fstype: &str, options: &str) -> Self {
        Self {
            spec: spec.to_string(),
            mountpoint: mountpoint.to_string(),
            fstype: fstype.to_string(),
            options: split_options(options),
            dump: None,
            pass: None,
        }
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|o| o == name)
    }

    pub fn is_noauto(&self) -> bool {
        self.has_option(NOAUTO)
    }

    pub fn is_swap(&self) -> bool {
        self.fstype == "swap"
    }

    /// Replace `old` with `new` in place, keeping option order and
    /// dropping a duplicate if `new` was already present.
    pub fn replace_option(&mut self, old: &str, new: &str) -> bool {
        let Some(pos) = self.options.iter().position(|o| o == old) else {
            return false;
        };
        if self.has_option(new) {
            self.options.remove(pos);
        } else {
            self.options[pos] = new.to_string();
        }
        true
    }

    /// Options as passed to `mount -o`.
    pub fn options_arg(&self) -> String {
        if self.options.is_empty() {
            "defaults".to_string()
        } else {
            self.options.join(",")
        }
    }
}

impl fmt::Display for MountTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            encode_field(&self.spec),
            encode_field(&self.mountpoint),
            self.fstype,
            self.options_arg(),
            self.dump.unwrap_or(0),
            self.pass.unwrap_or(0)
        )
    }
}

pub fn split_options(raw: &str) -> Vec<String> {
    let mut options: Vec<String> = Vec::new();
    for opt in raw.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        if !options.iter().any(|o| o == opt) {
            options.push(opt.to_string());
        }
    }
    options
}

pub fn read_fstab(path: &Path) -> Result<Vec<MountTableEntry>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading mount table '{}'", path.display()))?;
    parse_fstab(&raw).with_context(|| format!("parsing mount table '{}'", path.display()))
}

pub fn parse_fstab(raw: &str) -> Result<Vec<MountTableEntry>> {
    let mut entries = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            bail!(
                "line {}: expected at least 3 fields, found {}: '{}'",
                idx + 1,
                fields.len(),
                line
            );
        }
        let number = |pos: usize, what: &str| -> Result<Option<u32>> {
            fields
                .get(pos)
                .map(|raw| {
                    raw.parse::<u32>().with_context(|| {
                        format!("line {}: invalid {} field '{}'", idx + 1, what, raw)
                    })
                })
                .transpose()
        };

        entries.push(MountTableEntry {
            spec: decode_field(fields[0]),
            mountpoint: decode_field(fields[1]),
            fstype: fields[2].to_string(),
            options: fields.get(3).map(|o| split_options(o)).unwrap_or_default(),
            dump: number(4, "dump")?,
            pass: number(5, "pass")?,
        });
    }
    Ok(entries)
}

/// Entries mounted at `/`.
pub fn root_entries(entries: &[MountTableEntry]) -> Vec<&MountTableEntry> {
    entries.iter().filter(|e| e.mountpoint == "/").collect()
}

pub fn entry_for<'a>(entries: &'a [MountTableEntry], mountpoint: &str) -> Option<&'a MountTableEntry> {
    entries.iter().find(|e| e.mountpoint == mountpoint)
}

/// Decode `\NNN` octal escapes.
pub(crate) fn decode_field(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = &bytes[i + 1..i + 4];
            if oct.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = oct.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(v) = u8::try_from(value) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn encode_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ' ' => out.push_str("\\040"),
            '\t' => out.push_str("\\011"),
            '\\' => out.push_str("\\134"),
            _ => out.push(c),
        }
    }
    out
}
