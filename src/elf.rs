//! Architecture of an installed system, read from an ELF header.

use anyhow::{Context, Result};
use goblin::elf::header::{self, Header};
use goblin::elf::Elf;
use std::ffi::CStr;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Largest ELF file header (64-bit).
const HEADER_LEN: u64 = header::header64::SIZEOF_EHDR as u64;

/// Architecture declared by an ELF executable, or `None` if it isn't ELF.
pub fn read_elf_arch(path: &Path) -> Result<Option<String>> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut bytes = Vec::with_capacity(HEADER_LEN as usize);
    file.take(HEADER_LEN)
        .read_to_end(&mut bytes)
        .with_context(|| format!("reading '{}'", path.display()))?;
    Ok(Elf::parse_header(&bytes).ok().map(|h| arch_name(&h)))
}

fn arch_name(header: &Header) -> String {
    let is_64 = header.e_ident[header::EI_CLASS] == header::ELFCLASS64;
    let big_endian = header.e_ident[header::EI_DATA] == header::ELFDATA2MSB;

    let arch = match header.e_machine {
        header::EM_386 => "i386",
        header::EM_X86_64 => "x86_64",
        header::EM_PPC => "ppc",
        header::EM_PPC64 if big_endian => "ppc64",
        header::EM_PPC64 => "ppc64le",
        header::EM_S390 if is_64 => "s390x",
        header::EM_S390 => "s390",
        header::EM_ARM => "arm",
        header::EM_AARCH64 => "aarch64",
        header::EM_RISCV if is_64 => "riscv64",
        header::EM_RISCV => "riscv32",
        header::EM_IA_64 => "ia64",
        header::EM_SPARC => "sparc",
        header::EM_SPARCV9 => "sparc64",
        other => return format!("unknown-{other}"),
    };
    arch.to_string()
}

/// Architecture of the running system, from `uname(2)`.
pub fn host_arch() -> String {
    // SAFETY: utsname is plain old data and uname fills it in.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return normalize_arch(std::env::consts::ARCH);
    }
    // SAFETY: the kernel NUL-terminates every utsname field.
    let machine = unsafe { CStr::from_ptr(uts.machine.as_ptr()) };
    normalize_arch(&machine.to_string_lossy())
}

/// Map `uname -m` spellings onto the names [`read_elf_arch`] produces.
pub fn normalize_arch(raw: &str) -> String {
    match raw {
        "i386" | "i486" | "i586" | "i686" | "x86" => "i386",
        "amd64" => "x86_64",
        "arm64" => "aarch64",
        "powerpc" => "ppc",
        "powerpc64" => "ppc64",
        "powerpc64le" => "ppc64le",
        other if other.starts_with("armv") => "arm",
        other => other,
    }
    .to_string()
}

/// 32-bit and 64-bit big-endian PowerPC installations upgrade into each other.
pub fn arch_compatible(installed: &str, running: &str) -> bool {
    installed == running
        || matches!((installed, running), ("ppc", "ppc64") | ("ppc64", "ppc"))
}
