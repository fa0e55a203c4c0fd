use crate::buffer::Buffer;
use crate::notify::{ChannelSink, EndReason, SessionEvent};
use crate::session::{SessionController, SessionInfo};
use crate::terminal::cli::{Cli, ClientArgs, Command, LinkArgs, ShareArgs};
use crate::terminal::error::CliError;
use crate::terminal::render::Renderer;
use crate::transport::{ReqwestTransport, Transport};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

/// How long queued exit beacons get before the process leaves.
const BEACON_GRACE: Duration = Duration::from_secs(2);

pub async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Some(Command::Share(args)) => share(&cli.client, args).await,
        Some(Command::Link(args)) => link(&cli.client, args),
        None => share(&cli.client, ShareArgs::default()).await,
    }
}

fn link(client: &ClientArgs, args: LinkArgs) -> Result<(), CliError> {
    let config = client.to_config()?;
    println!("{}", config.download_link(args.id.trim()));
    Ok(())
}

async fn share(client: &ClientArgs, args: ShareArgs) -> Result<(), CliError> {
    let config = client.to_config()?;
    let text = read_input(args.file.as_deref()).await?;
    let buffer = Buffer::from(text);
    debug!(
        target: "livepaste::cli",
        api_base = %config.api_base(),
        length = buffer.byte_len(),
        "sharing buffer"
    );

    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&config)?);
    let (sink, events) = ChannelSink::new();
    let mut session = ShareSession {
        controller: SessionController::new(config, transport.clone(), Arc::new(sink)),
        transport,
        events,
        renderer: Renderer::stdio(args.output),
        signals: listen_for_termination()?,
    };
    let ending = session.run(buffer).await?;
    conclude(ending)
}

/// Exit status for a session that ended without a front-end error.
fn conclude(ending: EndReason) -> Result<(), CliError> {
    match ending {
        EndReason::Abandoned => Err(CliError::Abandoned),
        _ => Ok(()),
    }
}

/// One shared paste as seen from the terminal.
struct ShareSession<O: Write, E: Write> {
    controller: SessionController,
    transport: Arc<dyn Transport>,
    events: UnboundedReceiver<SessionEvent>,
    renderer: Renderer<O, E>,
    signals: UnboundedReceiver<Termination>,
}

impl<O: Write, E: Write> ShareSession<O, E> {
    /// Starts the session and follows it to the end.
    ///
    /// Once negotiation succeeds, the session is retired and pending beacons
    /// are flushed on every way out, including render failures.
    async fn run(&mut self, buffer: Buffer) -> Result<EndReason, CliError> {
        let info = self.negotiate(buffer).await?;
        let followed = self.follow(&info).await;
        self.release().await;
        followed
    }

    async fn negotiate(&mut self, buffer: Buffer) -> Result<SessionInfo, CliError> {
        let started = {
            let start = self.controller.start(buffer);
            tokio::pin!(start);
            loop {
                tokio::select! {
                    result = &mut start => break result,
                    Some(event) = self.events.recv() => self.renderer.event(&event)?,
                    signal = next_termination(&mut self.signals) => {
                        info!(
                            target: "livepaste::cli",
                            ?signal,
                            "interrupted during session request"
                        );
                        return Err(CliError::Interrupted);
                    }
                }
            }
        };
        match started {
            Ok(info) => Ok(info),
            Err(err) => {
                self.drain()?;
                Err(err.into())
            }
        }
    }

    async fn follow(&mut self, info: &SessionInfo) -> Result<EndReason, CliError> {
        self.drain()?;
        self.renderer.session_ready(info)?;
        let ending = self.watch().await?;
        self.drain()?;
        Ok(ending)
    }

    /// Renders events until the session ends. The first Ctrl-C cancels; a
    /// second one, SIGTERM or SIGHUP retires the session on the way out.
    async fn watch(&mut self) -> Result<EndReason, CliError> {
        let mut cancel_requested = false;
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(SessionEvent::Ended(reason)) => {
                        self.renderer.event(&SessionEvent::Ended(reason.clone()))?;
                        return Ok(reason);
                    }
                    Some(event) => self.renderer.event(&event)?,
                    None => return Ok(EndReason::Exited),
                },
                signal = next_termination(&mut self.signals) => {
                    if signal == Termination::Interrupt && !cancel_requested {
                        cancel_requested = true;
                        let controller = self.controller.clone();
                        tokio::spawn(async move {
                            if let Err(err) = controller.cancel().await {
                                debug!(target: "livepaste::cli", error = %err, "cancel skipped");
                            }
                        });
                        continue;
                    }
                    info!(target: "livepaste::cli", ?signal, "retiring session on exit");
                    if !retire_on_exit(&self.controller).await {
                        return Ok(EndReason::Exited);
                    }
                }
            }
        }
    }

    async fn release(&self) {
        if retire_on_exit(&self.controller).await {
            info!(target: "livepaste::cli", "session retired on early exit");
        }
        let pending = self.transport.flush_beacons(BEACON_GRACE).await;
        if pending > 0 {
            warn!(target: "livepaste::cli", pending, "exit beacons still in flight");
        }
    }

    fn drain(&mut self) -> Result<(), CliError> {
        while let Ok(event) = self.events.try_recv() {
            self.renderer.event(&event)?;
        }
        Ok(())
    }
}

/// Runs the teardown retirement on the blocking pool; it may block on a
/// synchronous request.
async fn retire_on_exit(controller: &SessionController) -> bool {
    let controller = controller.clone();
    match tokio::task::spawn_blocking(move || controller.retire_on_exit()).await {
        Ok(retired) => retired,
        Err(err) => {
            warn!(target: "livepaste::cli", error = %err, "exit retirement did not finish");
            false
        }
    }
}

async fn read_input(file: Option<&Path>) -> Result<String, CliError> {
    match file {
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
        None => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            Ok(text)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Termination {
    Interrupt,
    Terminate,
    Hangup,
}

/// A closed channel never yields.
async fn next_termination(signals: &mut UnboundedReceiver<Termination>) -> Termination {
    match signals.recv().await {
        Some(signal) => signal,
        None => std::future::pending().await,
    }
}

/// Installs the process signal handlers and forwards each delivery.
fn listen_for_termination() -> std::io::Result<UnboundedReceiver<Termination>> {
    let (tx, rx) = mpsc::unbounded_channel();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = interrupt() => Termination::Interrupt,
                    _ = terminate.recv() => Termination::Terminate,
                    _ = hangup.recv() => Termination::Hangup,
                };
                if tx.send(next).is_err() {
                    break;
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            loop {
                interrupt().await;
                if tx.send(Termination::Interrupt).is_err() {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

async fn interrupt() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target: "livepaste::cli", error = %err, "unable to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
