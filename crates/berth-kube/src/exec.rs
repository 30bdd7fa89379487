//! Cluster-side exec channel
//!
//! Discovers the instance's pod by label, opens the exec subresource,
//! and relays frames: stdin and terminal sizes flow in from the input
//! channel, stdout/stderr chunks flow out with a cloned buffer, and the
//! session ends with exactly one Exit frame.

use futures::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, ListParams, TerminalSize};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use berth_common::{Error, APP_INSTANCE, LABEL_APP, LABEL_INSTANCE_ID};
use berth_core::domain::{ExecInput, ExecOptions, ExecOutput, ExecStream};

/// Run one exec session.
///
/// Errors are returned only until the exec channel opens; afterwards the
/// session always reports through `output` and resolves `Ok`.
pub(crate) async fn stream_exec(
    client: Client,
    opts: ExecOptions,
    mut input: mpsc::Receiver<ExecInput>,
    output: mpsc::Sender<ExecOutput>,
) -> Result<(), Error> {
    let pods: Api<Pod> = Api::namespaced(client, &opts.namespace);

    let selector = format!(
        "{}={},{}={}",
        LABEL_INSTANCE_ID, opts.instance_id, LABEL_APP, APP_INSTANCE
    );
    let pod_list = pods
        .list(&ListParams::default().labels(&selector).limit(1))
        .await?;
    let Some(pod_name) = pod_list
        .items
        .first()
        .and_then(|pod| pod.metadata.name.clone())
    else {
        return Err(Error::not_found(format!(
            "pod for instance {} in namespace {}",
            opts.instance_id, opts.namespace
        )));
    };

    let params = AttachParams {
        stdin: true,
        stdout: true,
        stderr: !opts.tty,
        tty: opts.tty,
        container: Some(opts.container_name.clone()),
        max_stdin_buf_size: None,
        max_stdout_buf_size: None,
        max_stderr_buf_size: None,
    };

    let mut attached = pods.exec(&pod_name, opts.command.clone(), &params).await?;

    info!(
        namespace = %opts.namespace,
        pod = %pod_name,
        container = %opts.container_name,
        tty = opts.tty,
        "exec session established"
    );

    let cancel = CancellationToken::new();

    let mut reader_handles = Vec::new();
    if let Some(stdout) = attached.stdout() {
        reader_handles.push(tokio::spawn(read_stream(
            stdout,
            ExecStream::Stdout,
            output.clone(),
            cancel.clone(),
        )));
    }
    if let Some(stderr) = attached.stderr() {
        reader_handles.push(tokio::spawn(read_stream(
            stderr,
            ExecStream::Stderr,
            output.clone(),
            cancel.clone(),
        )));
    }

    let mut stdin_writer = attached.stdin();
    let mut size_sender = attached.terminal_size();
    let input_cancel = cancel.clone();
    let input_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = input_cancel.cancelled() => break,
                frame = input.recv() => match frame {
                    Some(ExecInput::Stdin(data)) => {
                        if let Some(writer) = stdin_writer.as_mut() {
                            if writer.write_all(&data).await.is_err()
                                || writer.flush().await.is_err()
                            {
                                break;
                            }
                        }
                    }
                    Some(ExecInput::Resize { rows, cols }) => {
                        if let Some(sender) = size_sender.as_mut() {
                            let _ = sender
                                .send(TerminalSize {
                                    width: cols,
                                    height: rows,
                                })
                                .await;
                        }
                        debug!(rows, cols, "terminal resized");
                    }
                    None => break,
                },
            }
        }
        // Dropping stdin/size lets the websocket close.
        drop(stdin_writer);
        drop(size_sender);
    });

    let status_rx = attached.take_status();

    // Wait for the cluster-side call; bail out early if the client is
    // gone (stream cancelled) - the session has no one to report to.
    let failure: Option<String> = tokio::select! {
        joined = attached.join() => match joined {
            Ok(()) => match status_rx {
                Some(status) => status.await.and_then(failure_message),
                None => None,
            },
            Err(e) => Some(e.to_string()),
        },
        _ = output.closed() => {
            debug!(pod = %pod_name, "client went away, tearing down exec session");
            cancel.cancel();
            let _ = input_handle.await;
            return Ok(());
        }
    };

    // Drain the readers so every Output frame precedes the Exit frame.
    cancel.cancel();
    for handle in reader_handles {
        let _ = handle.await;
    }
    let _ = input_handle.await;

    if let Some(message) = failure {
        error!(pod = %pod_name, error = %message, "exec stream error");
        let _ = output.send(ExecOutput::Error(message)).await;
        let _ = output.send(ExecOutput::Exit(1)).await;
    } else {
        let _ = output.send(ExecOutput::Exit(0)).await;
    }

    info!(pod = %pod_name, "exec session ended");
    Ok(())
}

/// Extract a failure message from the exec status channel, if any.
fn failure_message(status: Status) -> Option<String> {
    if status.status.as_deref() == Some("Failure") {
        Some(
            status
                .message
                .unwrap_or_else(|| "command failed".to_string()),
        )
    } else {
        None
    }
}

/// Drain one standard stream into the output channel.
async fn read_stream<R: AsyncRead + Unpin + Send + 'static>(
    mut reader: R,
    stream: ExecStream,
    output: mpsc::Sender<ExecOutput>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        // The read buffer is reused; clone the chunk.
                        let chunk = ExecOutput::Data {
                            stream,
                            data: buf[..n].to_vec(),
                        };
                        if output.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(stream = stream.as_str(), error = %e, "reader error");
                        break;
                    }
                }
            }
        }
    }
}
