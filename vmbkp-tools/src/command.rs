use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{format_err, Error};

/// Run a command with stdout and stderr appended to log files.
///
/// The output is not interpreted, only the exit status is returned.
pub fn run_command_logged<P: AsRef<Path>, Q: AsRef<Path>>(
    mut command: Command,
    stdout_log: P,
    stderr_log: Q,
) -> Result<ExitStatus, Error> {
    let open_log = |path: &Path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| format_err!("unable to open log file {:?} - {}", path, err))
    };

    let stdout = open_log(stdout_log.as_ref())?;
    let stderr = open_log(stderr_log.as_ref())?;

    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    log::debug!("executing {:?}", command);

    let status = command
        .status()
        .map_err(|err| format_err!("failed to execute {:?} - {}", command, err))?;

    Ok(status)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::path::PathBuf;

    fn create_testdir(name: &str) -> Result<String, Error> {
        let mut testdir: PathBuf = String::from("./target/testout").into();
        testdir.push(std::module_path!());
        testdir.push(name);

        let _ = std::fs::remove_dir_all(&testdir);
        let _ = std::fs::create_dir_all(&testdir);

        Ok(testdir.to_str().unwrap().to_string())
    }

    #[test]
    fn test_run_command_logged() -> Result<(), Error> {
        let testdir = create_testdir("logged")?;
        let out = format!("{}/out.log", testdir);
        let err = format!("{}/err.log", testdir);

        let mut command = Command::new("sh");
        command.args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let status = run_command_logged(command, &out, &err)?;
        assert_eq!(status.code(), Some(3));

        let mut command = Command::new("sh");
        command.args(["-c", "echo again"]);
        assert!(run_command_logged(command, &out, &err)?.success());

        assert_eq!(std::fs::read_to_string(&out)?, "hello\nagain\n");
        assert_eq!(std::fs::read_to_string(&err)?, "oops\n");
        Ok(())
    }
}
