//! External `command` step
//!
//! The program is treated as a pure function of the module content and path,
//! unless the step sets `cache = false`.

use std::process::Stdio;

use cow_utils::CowUtils;
use log::debug;
use tokio::{io::AsyncWriteExt, process::Command};

use super::{StepState, TransformContext, step::{CommandInput, CommandOptions}};

const PATH_PLACEHOLDER: &str = "{path}";

pub(super) async fn run(
    state: StepState,
    options: &CommandOptions,
    ctx: &TransformContext<'_>,
) -> Result<StepState, String> {
    let path = ctx.path.to_string_lossy();
    let args: Vec<String> = options
        .args
        .iter()
        .map(|arg| arg.cow_replace(PATH_PLACEHOLDER, &path).into_owned())
        .collect();
    let cwd = options
        .cwd
        .as_ref()
        .map_or_else(|| ctx.root.to_path_buf(), |dir| ctx.root.join(dir));

    debug!("Running '{} {}' for {}", options.program, args.join(" "), ctx.path.display());
    let mut child = Command::new(&options.program)
        .args(&args)
        .current_dir(&cwd)
        .stdin(match options.input {
            CommandInput::Stdin => Stdio::piped(),
            CommandInput::Path => Stdio::null(),
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to start '{}': {e}", options.program))?;

    // Feed stdin from its own task so a chatty child cannot block on a full stdout pipe
    let writer = child.stdin.take().map(|mut stdin| {
        let content = state.content;
        tokio::spawn(async move {
            let result = stdin.write_all(&content).await;
            drop(stdin);
            result
        })
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("failed to wait for '{}': {e}", options.program))?;

    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(())) => {}
            // The child may legitimately exit without reading all of stdin
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(format!("failed to write stdin: {e}")),
            Err(e) => return Err(format!("stdin writer panicked: {e}")),
        }
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "'{}' exited with {}: {}",
            options.program,
            output.status,
            stderr.trim()
        ));
    }

    Ok(StepState {
        content: output.stdout,
        kind: options.output,
        sub_resources: state.sub_resources,
    })
}
