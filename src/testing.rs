//! Test doubles shared by the unit tests.

use crate::decision::{DecisionPort, Notice, Question};
use crate::fstab::MountTableEntry;
use crate::process::{CommandOutput, ProcessRunner};
use anyhow::Result;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

/// Disk `sda` with boot, root and swap partitions; disk `sdb` with data.
pub const TWO_DISK_LSBLK: &str = r#"{
  "blockdevices": [
    {"name": "sda", "path": "/dev/sda", "type": "disk", "fstype": null, "label": null,
     "uuid": null, "partuuid": null, "partlabel": null, "pkname": null,
     "size": 64424509440, "mountpoint": null,
     "children": [
       {"name": "sda1", "path": "/dev/sda1", "type": "part", "fstype": "ext4", "label": "boot",
        "uuid": "boot-uuid", "partuuid": "part-1", "partlabel": null, "pkname": "sda",
        "size": 524288000, "mountpoint": null},
       {"name": "sda2", "path": "/dev/sda2", "type": "part", "fstype": "ext4", "label": "root",
        "uuid": "root-uuid", "partuuid": "part-2", "partlabel": null, "pkname": "sda",
        "size": 21474836480, "mountpoint": null},
       {"name": "sda3", "path": "/dev/sda3", "type": "part", "fstype": "swap", "label": null,
        "uuid": "swap-uuid", "partuuid": "part-3", "partlabel": null, "pkname": "sda",
        "size": 2147483648, "mountpoint": null}
     ]},
    {"name": "sdb", "path": "/dev/sdb", "type": "disk", "fstype": null, "label": null,
     "uuid": null, "partuuid": null, "partlabel": null, "pkname": null,
     "size": 128849018880, "mountpoint": null,
     "children": [
       {"name": "sdb1", "path": "/dev/sdb1", "type": "part", "fstype": "xfs", "label": "data",
        "uuid": "data-uuid", "partuuid": "part-b1", "partlabel": null, "pkname": "sdb",
        "size": 128848000000, "mountpoint": null}
     ]}
  ]
}"#;

/// One real disk plus a loop device and an optical drive.
pub const ONE_DISK_LSBLK: &str = r#"{
  "blockdevices": [
    {"name": "loop0", "path": "/dev/loop0", "type": "loop", "fstype": "squashfs",
     "size": 734003200},
    {"name": "sda", "path": "/dev/sda", "type": "disk", "size": 64424509440,
     "children": [
       {"name": "sda1", "path": "/dev/sda1", "type": "part", "fstype": "ext4", "label": "boot",
        "uuid": "boot-uuid", "pkname": "sda", "size": 52428800},
       {"name": "sda2", "path": "/dev/sda2", "type": "part", "fstype": "ext4", "label": "root",
        "uuid": "root-uuid", "pkname": "sda", "size": 21474836480},
       {"name": "sda3", "path": "/dev/sda3", "type": "part", "fstype": "xfs", "label": "var",
        "uuid": "var-uuid", "pkname": "sda", "size": 10737418240},
       {"name": "sda4", "path": "/dev/sda4", "type": "part", "fstype": "swap",
        "uuid": "swap-uuid", "pkname": "sda", "size": 2147483648},
       {"name": "sda5", "path": "/dev/sda5", "type": "part", "fstype": "ext4", "label": "home",
        "uuid": "home-uuid", "pkname": "sda", "size": 21474836480}
     ]},
    {"name": "sr0", "path": "/dev/sr0", "type": "rom", "fstype": "iso9660",
     "label": "INSTALL", "size": 4700000000}
  ]
}"#;

/// Three disks, `/var` candidates ambiguous.
pub const THREE_DISK_LSBLK: &str = r#"{
  "blockdevices": [
    {"name": "sda", "type": "disk", "children": [
      {"name": "sda1", "type": "part", "fstype": "ext4", "uuid": "root-uuid"}]},
    {"name": "sdb", "type": "disk", "children": [
      {"name": "sdb1", "type": "part", "fstype": "xfs"}]},
    {"name": "sdc", "type": "disk", "children": [
      {"name": "sdc1", "type": "part", "fstype": "xfs"}]}
  ]
}"#;

/// Write the first bytes of an ELF executable.
pub fn write_elf(path: &Path, machine: u16, is_64: bool, big_endian: bool) {
    let mut header = vec![0u8; 64];
    header[..4].copy_from_slice(b"\x7fELF");
    header[4] = if is_64 { 2 } else { 1 };
    header[5] = if big_endian { 2 } else { 1 };
    header[6] = 1;
    let bytes = if big_endian {
        machine.to_be_bytes()
    } else {
        machine.to_le_bytes()
    };
    header[18..20].copy_from_slice(&bytes);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, header).unwrap();
}

/// Lay out a minimal installed x86_64 system under `root`.
pub fn stage_system(root: &Path, fstab: &str) {
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::write(root.join("etc/fstab"), fstab).unwrap();
    fs::write(
        root.join("etc/os-release"),
        "NAME=\"openSUSE Leap\"\nVERSION_ID=\"15.5\"\nID=opensuse-leap\n",
    )
    .unwrap();
    write_elf(&root.join("bin/bash"), 62, true, false);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub program: String,
    pub args: Vec<String>,
    pub input: Option<String>,
}

type Handler = Box<dyn Fn(&[String]) -> CommandOutput>;

/// Records every command and answers from per-program handlers.
/// Unscripted programs succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    handlers: RefCell<Vec<(String, Handler)>>,
    calls: RefCell<Vec<Call>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later handlers for the same program take precedence.
    pub fn on(&self, program: &str, handler: impl Fn(&[String]) -> CommandOutput + 'static) {
        self.handlers
            .borrow_mut()
            .push((program.to_string(), Box::new(handler)));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    /// `program arg arg` per call.
    pub fn commands(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|c| {
                std::iter::once(c.program.as_str())
                    .chain(c.args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }

    pub fn count(&self, program: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.program == program)
            .count()
    }

    fn answer(&self, program: &str, args: &[String], input: Option<&str>) -> CommandOutput {
        self.calls.borrow_mut().push(Call {
            program: program.to_string(),
            args: args.to_vec(),
            input: input.map(str::to_string),
        });
        let handlers = self.handlers.borrow();
        handlers
            .iter()
            .rev()
            .find(|(name, _)| name == program)
            .map(|(_, handler)| handler(args))
            .unwrap_or_default()
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        Ok(self.answer(program, args, None))
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
    ) -> Result<CommandOutput> {
        Ok(self.answer(program, args, Some(input)))
    }
}

/// Answers from queues; an exhausted queue answers "no" / cancel.
#[derive(Default)]
pub struct ScriptedDecisions {
    yes_no: VecDeque<bool>,
    choices: VecDeque<Option<usize>>,
    secrets: VecDeque<Option<String>>,
    edits: VecDeque<Option<MountTableEntry>>,
    prompts: Vec<String>,
    notices: Vec<Notice>,
}

impl ScriptedDecisions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn yes_no(mut self, answers: impl IntoIterator<Item = bool>) -> Self {
        self.yes_no.extend(answers);
        self
    }

    pub fn choices(mut self, answers: impl IntoIterator<Item = Option<usize>>) -> Self {
        self.choices.extend(answers);
        self
    }

    pub fn secrets<S: Into<String>>(mut self, answers: impl IntoIterator<Item = Option<S>>) -> Self {
        self.secrets
            .extend(answers.into_iter().map(|s| s.map(Into::into)));
        self
    }

    pub fn edits(mut self, answers: impl IntoIterator<Item = Option<MountTableEntry>>) -> Self {
        self.edits.extend(answers);
        self
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }
}

impl DecisionPort for ScriptedDecisions {
    fn ask_yes_no(&mut self, question: &Question) -> bool {
        self.prompts.push(question.to_string());
        self.yes_no.pop_front().unwrap_or(false)
    }

    fn ask_choice(&mut self, prompt: &str, options: &[String]) -> Option<usize> {
        self.prompts
            .push(format!("{prompt} [{}]", options.join(" | ")));
        self.choices.pop_front().flatten()
    }

    fn ask_secret(&mut self, prompt: &str) -> Option<Zeroizing<String>> {
        self.prompts.push(prompt.to_string());
        self.secrets.pop_front().flatten().map(Zeroizing::new)
    }

    fn edit_mount_entry(&mut self, entry: &MountTableEntry) -> Option<MountTableEntry> {
        self.prompts.push(format!("edit {entry}"));
        self.edits.pop_front().flatten()
    }

    fn notify(&mut self, notice: &Notice) {
        self.notices.push(notice.clone());
    }
}
