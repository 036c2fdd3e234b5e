//! Invocation of the external disk copy tool (`vmdkbkp`).
//!
//! The tool does the actual byte transfer. We only build its command line,
//! redirect its output into log files inside the generation directory and
//! look at the exit status.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, format_err, Error};

use vmbkp_api_types::BackupMode;
use vmbkp_config::global::{GlobalConfig, VSphereConfig};

use crate::chain::GenerationId;

/// Parameters of one `vmdkbkp dump` call.
#[derive(Clone, Debug)]
pub struct DumpRequest {
    pub mode: BackupMode,
    pub vm_moref: String,
    pub snapshot_moref: String,
    pub remote_path: String,
    pub san: bool,
    /// Previous full dump, diff and incr only.
    pub dump_in: Option<PathBuf>,
    /// Previous digest, diff and incr only.
    pub digest_in: Option<PathBuf>,
    pub dump_out: PathBuf,
    pub digest_out: PathBuf,
    /// Changed block bitmap, incr only.
    pub bitmap_in: Option<PathBuf>,
    /// Reverse delta to the previous dump, diff and incr only.
    pub rdiff_out: Option<PathBuf>,
    /// Generation directory, the tool runs inside it.
    pub work_dir: PathBuf,
    pub disk_id: usize,
}

/// Parameters of a `vmdkbkp restore` call.
#[derive(Clone, Debug)]
pub struct RestoreRequest {
    pub vm_moref: String,
    pub snapshot_moref: String,
    pub remote_path: String,
    pub san: bool,
    pub digest_in: PathBuf,
    /// Full dump followed by the reverse deltas to apply.
    pub paths: Vec<PathBuf>,
    pub work_dir: PathBuf,
    pub generation_id: GenerationId,
    pub disk_id: usize,
}

/// Parameters of a `vmdkbkp check` call.
#[derive(Clone, Debug)]
pub struct CheckRequest {
    pub vm_moref: String,
    pub digest_in: PathBuf,
    pub paths: Vec<PathBuf>,
    pub work_dir: PathBuf,
    pub generation_id: GenerationId,
    pub disk_id: usize,
}

/// Something which copies a disk into the archive.
pub trait DiskDumper {
    /// Fails unless the copy completed.
    fn dump(&self, request: &DumpRequest) -> Result<(), Error>;
}

/// `vmdkbkp` binary together with the hypervisor credentials.
#[derive(Clone, Debug)]
pub struct VmdkBkp {
    binary: PathBuf,
    server: String,
    username: String,
    password: String,
}

fn require(value: Option<String>, what: &str) -> Result<String, Error> {
    value.ok_or_else(|| format_err!("vsphere {} is not configured", what))
}

impl VmdkBkp {
    pub fn new<P: Into<PathBuf>>(binary: P, vsphere: &VSphereConfig) -> Result<Self, Error> {
        Ok(Self {
            binary: binary.into(),
            server: require(vsphere.server.clone(), "server")?,
            username: require(vsphere.username.clone(), "username")?,
            password: require(vsphere.password.clone(), "password")?,
        })
    }

    pub fn from_config(config: &GlobalConfig) -> Result<Self, Error> {
        Self::new(config.vmdkbkp_path()?, &config.vsphere())
    }

    fn command(&self, operation: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg(operation);
        command
    }

    fn connection_args(&self, command: &mut Command, vm_moref: &str, snapshot_moref: &str) {
        command
            .arg("--server")
            .arg(&self.server)
            .arg("--username")
            .arg(&self.username)
            .arg("--password")
            .arg(&self.password)
            .arg("--vm")
            .arg(vm_moref)
            .arg("--snapshot")
            .arg(snapshot_moref);
    }

    pub fn dump_command(&self, request: &DumpRequest) -> Result<Command, Error> {
        let delta = match request.mode {
            BackupMode::Full => false,
            BackupMode::Diff | BackupMode::Incr => true,
            BackupMode::Unknown => bail!("backup mode of disk {} is unknown", request.disk_id),
        };

        let mut command = self.command("dump");
        command.arg("--mode").arg(request.mode.as_str());
        self.connection_args(&mut command, &request.vm_moref, &request.snapshot_moref);
        command.arg("--remote").arg(&request.remote_path);
        if request.san {
            command.arg("--san");
        }

        if delta {
            let dump_in = request
                .dump_in
                .as_ref()
                .ok_or_else(|| format_err!("{} backup needs the previous dump", request.mode))?;
            command.arg("--dumpin").arg(dump_in);
        }
        command.arg("--dumpout").arg(&request.dump_out);

        if delta {
            let digest_in = request
                .digest_in
                .as_ref()
                .ok_or_else(|| format_err!("{} backup needs the previous digest", request.mode))?;
            command.arg("--digestin").arg(digest_in);
        }
        command.arg("--digestout").arg(&request.digest_out);

        if request.mode == BackupMode::Incr {
            let bitmap_in = request
                .bitmap_in
                .as_ref()
                .ok_or_else(|| format_err!("incr backup needs a changed block bitmap"))?;
            command.arg("--bmpin").arg(bitmap_in);
        }

        if delta {
            let rdiff_out = request
                .rdiff_out
                .as_ref()
                .ok_or_else(|| format_err!("{} backup needs an rdiff output", request.mode))?;
            command.arg("--rdiffout").arg(rdiff_out);
        }

        command.current_dir(&request.work_dir);
        Ok(command)
    }

    pub fn restore_command(&self, request: &RestoreRequest) -> Result<Command, Error> {
        if request.paths.is_empty() {
            bail!("nothing to restore for disk {}", request.disk_id);
        }

        let mut command = self.command("restore");
        self.connection_args(&mut command, &request.vm_moref, &request.snapshot_moref);
        command.arg("--remote").arg(&request.remote_path);
        if request.san {
            command.arg("--san");
        }
        command
            .arg("--digestin")
            .arg(&request.digest_in)
            .arg("--omitzeroblock")
            .args(&request.paths)
            .current_dir(&request.work_dir);
        Ok(command)
    }

    pub fn check_command(&self, request: &CheckRequest) -> Result<Command, Error> {
        if request.paths.is_empty() {
            bail!("nothing to check for disk {}", request.disk_id);
        }

        let mut command = self.command("check");
        command
            .arg("--digestin")
            .arg(&request.digest_in)
            .args(&request.paths)
            .current_dir(&request.work_dir);
        Ok(command)
    }

    pub fn restore(&self, request: &RestoreRequest) -> Result<(), Error> {
        let command = self.restore_command(request)?;
        let base = log_base_name(
            "restore",
            &request.vm_moref,
            request.generation_id,
            request.disk_id,
        );
        run(command, &request.work_dir, &base)
    }

    pub fn check(&self, request: &CheckRequest) -> Result<(), Error> {
        let command = self.check_command(request)?;
        let base = log_base_name(
            "check",
            &request.vm_moref,
            request.generation_id,
            request.disk_id,
        );
        run(command, &request.work_dir, &base)
    }
}

impl DiskDumper for VmdkBkp {
    fn dump(&self, request: &DumpRequest) -> Result<(), Error> {
        let command = self.dump_command(request)?;
        run(command, &request.work_dir, &request.disk_id.to_string())
    }
}

/// `vmdkbkp.<operation>.<moref>.<generation>.<disk>`
pub fn log_base_name(
    operation: &str,
    moref: &str,
    generation: GenerationId,
    disk_id: usize,
) -> String {
    format!("vmdkbkp.{}.{}.{}.{}", operation, moref, generation, disk_id)
}

fn run(command: Command, work_dir: &Path, base: &str) -> Result<(), Error> {
    if !work_dir.is_dir() {
        bail!("working directory {:?} does not exist", work_dir);
    }

    let stdout_log = work_dir.join(format!("{}.log", base));
    let stderr_log = work_dir.join(format!("{}.err", base));

    log::info!("exec: {}", command_line(&command));

    let status = vmbkp_tools::run_command_logged(command, &stdout_log, &stderr_log)?;
    if !status.success() {
        bail!("vmdkbkp failed with {} (see {:?})", status, stderr_log);
    }
    Ok(())
}

/// Command line for log output, the password is masked.
pub fn command_line(command: &Command) -> String {
    let mut parts: Vec<OsString> = vec![command.get_program().to_owned()];
    let mut mask_next = false;
    for arg in command.get_args() {
        if mask_next {
            parts.push(OsString::from("********"));
            mask_next = false;
            continue;
        }
        mask_next = arg == "--password";
        parts.push(arg.to_owned());
    }
    parts
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod test {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    use crate::test_utils::create_testdir;

    fn args(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn tool(binary: &str) -> VmdkBkp {
        let vsphere = VSphereConfig {
            server: Some(String::from("vc01")),
            url: None,
            username: Some(String::from("backup")),
            password: Some(String::from("secret")),
        };
        VmdkBkp::new(binary, &vsphere).unwrap()
    }

    fn dump_request(mode: BackupMode, work_dir: &str) -> DumpRequest {
        let delta = mode != BackupMode::Full;
        DumpRequest {
            mode,
            vm_moref: String::from("vm-101"),
            snapshot_moref: String::from("snapshot-7"),
            remote_path: String::from("[ds1] web01/web01.vmdk"),
            san: false,
            dump_in: delta.then(|| PathBuf::from("/a/2/0.dump.gz")),
            digest_in: delta.then(|| PathBuf::from("/a/2/0.digest.gz")),
            dump_out: PathBuf::from("0.dump.gz"),
            digest_out: PathBuf::from("0.digest.gz"),
            bitmap_in: (mode == BackupMode::Incr).then(|| PathBuf::from("0.bmp")),
            rdiff_out: delta.then(|| PathBuf::from("0.rdiff.gz")),
            work_dir: PathBuf::from(work_dir),
            disk_id: 0,
        }
    }

    #[test]
    fn test_dump_args() -> Result<(), Error> {
        let tool = tool("/usr/bin/vmdkbkp");

        let full = tool.dump_command(&dump_request(BackupMode::Full, "/a/3"))?;
        assert_eq!(
            args(&full),
            vec![
                "dump", "--mode", "full", "--server", "vc01", "--username", "backup",
                "--password", "secret", "--vm", "vm-101", "--snapshot", "snapshot-7",
                "--remote", "[ds1] web01/web01.vmdk", "--dumpout", "0.dump.gz",
                "--digestout", "0.digest.gz",
            ]
        );

        let mut request = dump_request(BackupMode::Incr, "/a/3");
        request.san = true;
        let incr = tool.dump_command(&request)?;
        assert_eq!(
            args(&incr)[13..],
            [
                "--remote", "[ds1] web01/web01.vmdk", "--san",
                "--dumpin", "/a/2/0.dump.gz", "--dumpout", "0.dump.gz",
                "--digestin", "/a/2/0.digest.gz", "--digestout", "0.digest.gz",
                "--bmpin", "0.bmp", "--rdiffout", "0.rdiff.gz",
            ]
        );
        assert!(!command_line(&incr).contains("secret"));

        let mut request = dump_request(BackupMode::Diff, "/a/3");
        request.digest_in = None;
        assert!(tool.dump_command(&request).is_err());
        assert!(tool.dump_command(&dump_request(BackupMode::Unknown, "/a/3")).is_err());
        Ok(())
    }

    #[test]
    fn test_restore_and_check_args() -> Result<(), Error> {
        let tool = tool("/usr/bin/vmdkbkp");
        let paths = vec![PathBuf::from("/a/3/0.dump.gz"), PathBuf::from("/a/3/0.rdiff.gz")];

        let restore = tool.restore_command(&RestoreRequest {
            vm_moref: String::from("vm-101"),
            snapshot_moref: String::from("snapshot-9"),
            remote_path: String::from("[ds1] new/new.vmdk"),
            san: false,
            digest_in: PathBuf::from("/a/3/0.digest.gz"),
            paths: paths.clone(),
            work_dir: PathBuf::from("/a/2"),
            generation_id: 2,
            disk_id: 0,
        })?;
        assert_eq!(
            args(&restore)[9..],
            [
                "--snapshot", "snapshot-9", "--remote", "[ds1] new/new.vmdk",
                "--digestin", "/a/3/0.digest.gz", "--omitzeroblock",
                "/a/3/0.dump.gz", "/a/3/0.rdiff.gz",
            ]
        );

        let check = tool.check_command(&CheckRequest {
            vm_moref: String::from("vm-101"),
            digest_in: PathBuf::from("/a/3/0.digest.gz"),
            paths,
            work_dir: PathBuf::from("/a/2"),
            generation_id: 2,
            disk_id: 0,
        })?;
        assert_eq!(
            args(&check),
            vec!["check", "--digestin", "/a/3/0.digest.gz", "/a/3/0.dump.gz", "/a/3/0.rdiff.gz"]
        );
        assert_eq!(log_base_name("check", "vm-101", 2, 0), "vmdkbkp.check.vm-101.2.0");
        Ok(())
    }

    #[test]
    fn test_run_tool() -> Result<(), Error> {
        let testdir = create_testdir(std::module_path!(), "run_tool")?;
        let script = format!("{}/fake-vmdkbkp", testdir);
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"$@\"\necho oops >&2\n[ \"$3\" = full ]\n",
        )?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;

        let tool = tool(&script);
        tool.dump(&dump_request(BackupMode::Full, &testdir))?;

        let log = std::fs::read_to_string(format!("{}/0.log", testdir))?;
        assert!(log.starts_with("dump --mode full"));
        let err = std::fs::read_to_string(format!("{}/0.err", testdir))?;
        assert_eq!(err, "oops\n");

        // non zero exit status
        assert!(tool.dump(&dump_request(BackupMode::Diff, &testdir)).is_err());
        // missing working directory
        let missing = format!("{}/nonexistent", testdir);
        assert!(tool.dump(&dump_request(BackupMode::Full, &missing)).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_credentials() -> Result<(), Error> {
        let vsphere = VSphereConfig {
            server: Some(String::from("vc01")),
            ..Default::default()
        };
        assert!(VmdkBkp::new("/usr/bin/vmdkbkp", &vsphere).is_err());

        let testdir = create_testdir(std::module_path!(), "missing_credentials")?;
        let config = vmbkp_config::global::create_global_config(
            format!("{}/vmbkp_global.conf", testdir),
            Path::new(&testdir),
            Path::new("/bin/sh"),
            5,
        )?;
        assert!(VmdkBkp::from_config(&config).is_err());
        Ok(())
    }
}
