use std::ffi::OsString;
use std::io::{Error, ErrorKind, Result};
use std::process::{Command, Stdio};

/// Set in the environment of a test re-executed under sudo.
pub const ELEVATED_ENV: &str = "NETTEST_ELEVATED";

pub fn execute_sudo_command(command: &str) -> Result<()> {
    let output = Command::new("sudo")
        .arg("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    if !output.status.success() {
        return Err(Error::other(format!(
            "Command failed with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    log::info!("Command succeeded: {command}");
    log::debug!("Output: {}", String::from_utf8_lossy(&output.stdout));
    Ok(())
}

/// Capabilities from `required` that are not in the effective set.
pub fn missing_capabilities(required: &[caps::Capability]) -> Vec<caps::Capability> {
    required
        .iter()
        .copied()
        .filter(|cap| !caps::has_cap(None, caps::CapSet::Effective, *cap).unwrap_or(false))
        .collect()
}

/// Initialises logging and makes sure the process holds `required`. A process lacking
/// any of them replaces itself with the same command line under sudo; a process that
/// already went through sudo and still lacks them fails.
pub fn setup(required: &[caps::Capability]) -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let missing = missing_capabilities(required);
    if missing.is_empty() {
        return Ok(());
    }
    if std::env::var_os(ELEVATED_ENV).is_some() {
        return Err(Error::new(
            ErrorKind::PermissionDenied,
            format!("missing capabilities {missing:?} even under sudo"),
        ));
    }
    log::info!("missing capabilities {missing:?}, re-running under sudo");
    let mut args: Vec<OsString> = vec![
        "-E".into(),
        "env".into(),
        format!("{ELEVATED_ENV}=1").into(),
        std::env::current_exe()?.into(),
    ];
    args.extend(std::env::args_os().skip(1));
    let err = exec::Command::new("sudo").args(&args).exec();
    Err(Error::other(format!("Failed to re-run under sudo: {err}")))
}
