use std::process::{Command, ExitStatus};

pub fn get_command_str(cmd: &Command) -> String {
    let prog = cmd.get_program().to_string_lossy();
    let args = cmd.get_args().map(|x| x.to_string_lossy());
    std::iter::once(prog)
        .chain(args)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Human readable reason of a process exit, e.g. `exited with code: 1` or
/// `terminated by signal: 9`.
pub fn describe_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt; // for status.signal()
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code: {}", code),
        (None, Some(sig)) => format!("terminated by signal: {}", sig),
        (None, None) => format!("{}", status),
    }
}

/// Run the command to completion and return stdout followed by stderr.
///
/// A non-zero exit is an error that carries both the exit reason and whatever
/// the command printed, so remote failures stay diagnosable.
pub fn get_command_output(mut cmd: Command) -> anyhow::Result<String> {
    let cmd_str = get_command_str(&cmd);
    log::debug!("executing command: {}", cmd_str);

    let result = cmd.output()?;

    let mut combined = String::from_utf8_lossy(&result.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&result.stderr));

    if !result.status.success() {
        return Err(anyhow::anyhow!(
            "{}, output: {}",
            describe_exit(&result.status),
            combined.trim()
        ));
    }

    Ok(combined)
}
