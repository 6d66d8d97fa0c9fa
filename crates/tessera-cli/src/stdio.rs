//! JSON-lines driver for a kernel.
//!
//! Reads one request per line, prints one kernel message per line. Ctrl+C
//! interrupts the running cell; end of input waits for queued requests and
//! exits.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use tessera_kernel::{Kernel, KernelConfig, KernelMessage, Request};

/// Drive a kernel from `input` until it ends.
pub async fn execute<R>(input: R, config: KernelConfig) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let kernel = Kernel::spawn(config);
    tracing::info!("Session {} started", kernel.session_id());
    let printer = tokio::spawn(print_messages(kernel.stream()));

    let mut lines = input.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !submit_line(&kernel, &line) {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                if !kernel.interrupt() {
                    tracing::warn!("Interrupt ignored: no cell is running");
                }
            }
        }
    }

    kernel.shutdown().await?;
    if let Some(message) = printer.await?? {
        anyhow::bail!("Kernel stopped: {}", message);
    }
    Ok(())
}

/// Submit one input line. Returns false once the kernel stopped accepting
/// requests.
fn submit_line(kernel: &Kernel, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }

    let request = match Request::from_json(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Ignoring malformed request: {}", e);
            return true;
        }
    };

    match kernel.submit(request) {
        Ok(request_id) => {
            tracing::debug!("Submitted request {}", request_id);
            true
        }
        Err(e) => {
            tracing::warn!("Failed to submit request: {}", e);
            false
        }
    }
}

/// Print every message until the kernel shuts down. Returns the fatal
/// error message, if the kernel stopped on one.
async fn print_messages(
    mut rx: mpsc::UnboundedReceiver<KernelMessage>,
) -> anyhow::Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    let mut fatal = None;

    while let Some(message) = rx.recv().await {
        if let KernelMessage::Fatal { message } = &message {
            fatal = Some(message.clone());
        }
        let mut line = message.to_json()?;
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(fatal)
}
