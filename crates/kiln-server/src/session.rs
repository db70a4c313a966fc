//! One connection, from its first byte to close.
//!
//! ```text
//! AwaitArgument ──Argument──> validate ──refused──> Closed
//!                                 │
//!                                 v
//!                           Negotiating ──DependencyReply──┐
//!                                 │  ^                     │
//!                                 │  └─────────────────────┘
//!                                 v
//!                              compile ──> send result ──> Closed
//! ```
//!
//! Messages are handled in arrival order, one at a time. At most one
//! `DependencyRequest` is outstanding; the next reply answers it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use kiln_cache::Cache;
use kiln_env::{
    Arguments, EnvError, Environment, EnvironmentOptions, ShellEnvironment, sandbox, unmap_path,
};
use kiln_proto::{
    ArgumentMessage, CompilationResultMessage, ContentHash, DependencyReplyMessage,
    DependencyRequestMessage, EX_IOERR, EX_TEMPFAIL, Message,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, ServerError};
use crate::order::DependencyOrder;
use crate::refusal;

/// Bytes requested from the socket per read
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Requests for one dependency before the session gives up on it
pub const MAX_DEPENDENCY_ATTEMPTS: u32 = 3;

/// Poll interval of the disconnect watcher when the client sends data
/// while its compilation runs
const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State shared by every session of one server.
#[derive(Debug)]
pub struct SessionContext {
    pub cache: Arc<Cache>,
    /// Instance folders are created under this directory
    pub scratch: Utf8PathBuf,
    pub compilation_timeout: Duration,
    pub shuffle_seed: Option<u64>,
}

enum State {
    AwaitArgument,
    Negotiating(Negotiation),
    Closed,
}

struct Negotiation {
    /// Mapped invocation, target flag included
    arguments: Arguments,
    environment: Environment,
    order: DependencyOrder,
    /// Requests sent so far for the current head
    attempts: u32,
}

pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<SessionContext>,
    state: State,
}

impl Session {
    pub fn new(stream: TcpStream, peer: SocketAddr, context: Arc<SessionContext>) -> Self {
        Self {
            stream,
            peer,
            context,
            state: State::AwaitArgument,
        }
    }

    /// Serve the connection until it closes. Errors end this session only.
    pub async fn run(mut self) {
        debug!(peer = %self.peer, "session started");
        match self.serve().await {
            Ok(()) => debug!("session finished"),
            Err(e) => warn!(error = %e, "session ended with error"),
        }
        self.close().await;
    }

    /// Enter `Closed`, deleting the workspace of an unfinished negotiation.
    async fn close(&mut self) {
        if let State::Negotiating(negotiation) = std::mem::replace(&mut self.state, State::Closed) {
            negotiation.environment.remove().await;
        }
    }

    fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    async fn serve(&mut self) -> Result<()> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        while !self.is_closed() {
            if !buffer.is_empty() {
                let (needed, message) = Message::from_bytes(&buffer)?;
                if let Some(message) = message {
                    if needed < 0 {
                        let trailing = needed.unsigned_abs() as usize;
                        trace!(trailing, "more data buffered after message");
                        buffer.drain(..buffer.len() - trailing);
                    } else {
                        buffer.clear();
                    }
                    self.dispatch(message).await?;
                    continue;
                }
                trace!(needed, "incomplete message, reading more");
            }

            let read = self.read_chunk(&mut chunk).await?;
            if read == 0 {
                if buffer.is_empty() {
                    info!("connection closed by client");
                } else {
                    error!(
                        buffered = buffer.len(),
                        "connection closed while a message was only partly received"
                    );
                }
                return Ok(());
            }
            buffer.extend_from_slice(&chunk[..read]);
        }

        // Result sent: close our side so the client sees a clean EOF
        if let Err(e) = self.stream.shutdown().await {
            debug!(error = %e, "shutdown after result failed");
        }
        Ok(())
    }

    async fn read_chunk(&mut self, chunk: &mut [u8]) -> Result<usize> {
        let timeout = self.context.compilation_timeout;
        match tokio::time::timeout(timeout, self.stream.read(chunk)).await {
            Ok(Ok(read)) => Ok(read),
            Ok(Err(e)) if is_disconnect(&e) => Ok(0),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ServerError::IdleTimeout {
                secs: timeout.as_secs(),
            }),
        }
    }

    async fn dispatch(&mut self, message: Message) -> Result<()> {
        debug!(kind = %message.kind(), "received message");
        match message {
            Message::Argument(argument) => self.handle_argument(argument).await,
            Message::DependencyReply(reply) => self.handle_dependency_reply(reply).await,
            other => {
                warn!(kind = %other.kind(), "ignoring message only the server sends");
                Ok(())
            }
        }
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let frame = message.to_bytes()?;
        self.stream.write_all(&frame).await?;
        trace!(kind = %message.kind(), bytes = frame.len(), "sent message");
        Ok(())
    }

    /// Refusal handshake; the session is closed afterwards.
    async fn refuse(&mut self, reason: &str) -> Result<()> {
        info!(reason, "refusing client");
        self.close().await;
        refusal::refuse(&mut self.stream, reason).await
    }

    async fn handle_argument(&mut self, message: ArgumentMessage) -> Result<()> {
        if !matches!(self.state, State::AwaitArgument) {
            warn!("ignoring repeated Argument message");
            return Ok(());
        }

        let arguments = match Arguments::from_vec(message.args.clone()) {
            Ok(arguments) => arguments,
            Err(e) => return self.refuse(&format!("Invalid compiler invocation: {e}")).await,
        };
        if !message.compression.is_none() {
            info!(compression = %message.compression, "using compression");
        }

        if let Some(reason) = self.check_sandbox(&message).await {
            return self.refuse(&reason).await;
        }

        let options = EnvironmentOptions {
            shell: ShellEnvironment::from_request(
                message.schroot_profile.as_deref(),
                message.docker_container.as_deref(),
            ),
            compression: message.compression,
            compilation_timeout: self.context.compilation_timeout,
        };
        let environment = match Environment::create(&self.context.scratch, &message.cwd, options).await
        {
            Ok(environment) => environment,
            Err(EnvError::PathOutsideInstance { path }) => {
                return self.refuse(&outside_workspace_reason(&path)).await;
            }
            Err(e) => {
                error!(error = %e, "could not prepare workspace");
                return self.refuse("Server could not prepare a workspace").await;
            }
        };

        if !environment.compiler_exists(&arguments).await {
            warn!(
                compiler = arguments.compiler(),
                shell = environment.shell().name(),
                "requested compiler is not installed"
            );
            let reason = format!(
                "Compiler '{}' is not available on the server, can not compile remotely",
                arguments.compiler()
            );
            return self.refuse(&reason).await;
        }

        let mut arguments = arguments;
        if let Some(target) = message.target.as_deref() {
            match environment.compiler_supports_target(&arguments, target).await {
                Ok(true) => {}
                Ok(false) => {
                    let reason = format!(
                        "Compiler '{}' does not support target '{}'.",
                        arguments.compiler(),
                        target
                    );
                    return self.refuse(&reason).await;
                }
                Err(e) => warn!(
                    triple = target,
                    error = %e,
                    "could not determine target support, trying the target anyway"
                ),
            }

            if environment.compiler_target_triple(&arguments).await.as_deref() != Some(target) {
                info!(triple = target, "using explicit target");
                arguments = arguments.with_target(target);
            }
        }

        let mapped = environment.map_args(&arguments).and_then(|arguments| {
            let dependencies = environment.map_dependency_paths(&message.dependencies)?;
            Ok((arguments, dependencies))
        });
        let (arguments, mapped) = match mapped {
            Ok(mapped) => mapped,
            Err(EnvError::PathOutsideInstance { path }) => {
                environment.remove().await;
                return self.refuse(&outside_workspace_reason(&path)).await;
            }
            Err(e) => return Err(e.into()),
        };
        debug!(args = %arguments, "mapped compiler arguments");

        let needed = environment
            .get_needed_dependencies(&mapped, &self.context.cache)
            .await?;
        info!(
            cached = mapped.len() - needed.len(),
            missing = needed.len(),
            "resolved dependencies"
        );

        let order = match self.context.shuffle_seed {
            Some(seed) => DependencyOrder::shuffled(needed, &mut StdRng::seed_from_u64(seed)),
            None => DependencyOrder::shuffled(needed, &mut rand::thread_rng()),
        };

        self.state = State::Negotiating(Negotiation {
            arguments,
            environment,
            order,
            attempts: 0,
        });
        self.negotiate().await
    }

    /// Refusal reason if the requested schroot profile or docker container
    /// cannot be used.
    async fn check_sandbox(&self, message: &ArgumentMessage) -> Option<String> {
        if let Some(profile) = message.schroot_profile.as_deref() {
            if !sandbox::is_schroot_available().await {
                return Some(format!(
                    "Profile {profile} could not be used as 'schroot' is not installed on the server"
                ));
            }
            if !sandbox::is_valid_schroot_profile(profile).await {
                let profiles = sandbox::schroot_profiles().await;
                return Some(format!(
                    "Profile {profile} could not be used as it is not a provided profile [{}].",
                    profiles.join(", ")
                ));
            }
            info!(profile, "using schroot profile");
        }

        if let Some(container) = message.docker_container.as_deref() {
            if !sandbox::is_docker_available().await {
                return Some(format!(
                    "Docker container '{container}' could not be used as the server hasn't installed docker"
                ));
            }
            if !sandbox::is_valid_docker_container(container).await {
                return Some(format!(
                    "Docker container '{container}' could not be used as it is not a valid or \
                     running container on the server"
                ));
            }
            info!(container, "using docker container");
        }

        None
    }

    /// Link cached dependencies until one must come from the client, then
    /// request it. With nothing left, compile.
    async fn negotiate(&mut self) -> Result<()> {
        let State::Negotiating(negotiation) = &mut self.state else {
            return Ok(());
        };

        while let Some((path, hash)) = negotiation
            .order
            .head()
            .map(|(path, hash)| (path.to_string(), hash))
        {
            trace!(remaining = negotiation.order.len(), "dependencies left");

            if self.context.cache.contains(&hash).await {
                debug!(hash = %hash.short_hex(), "dependency is in cache");
                negotiation
                    .environment
                    .link_dependency_to_cache(&path, &hash, &self.context.cache)
                    .await?;
                negotiation.order.complete_head();
                negotiation.attempts = 0;
                continue;
            }

            negotiation.attempts += 1;
            debug!(hash = %hash.short_hex(), attempt = negotiation.attempts, "requesting dependency");
            return self.send(DependencyRequestMessage::new(hash).into()).await;
        }

        self.compile().await
    }

    async fn handle_dependency_reply(&mut self, reply: DependencyReplyMessage) -> Result<()> {
        let State::Negotiating(negotiation) = &mut self.state else {
            warn!("ignoring DependencyReply while no dependency is outstanding");
            return Ok(());
        };
        let Some((path, expected)) = negotiation
            .order
            .head()
            .map(|(path, hash)| (path.to_string(), hash))
        else {
            warn!("ignoring DependencyReply while no dependency is outstanding");
            return Ok(());
        };

        let negotiated = negotiation.environment.compression();
        if reply.compression != negotiated {
            let reason = format!(
                "Dependency reply used '{}' compression, but '{}' was negotiated",
                reply.compression, negotiated
            );
            return self.refuse(&reason).await;
        }

        let actual = ContentHash::of(&reply.content);
        if actual != expected {
            let client_path = unmap_path(negotiation.environment.instance().as_str(), &path);
            error!(
                path = %client_path,
                expected = %expected.short_hex(),
                actual = %actual.short_hex(),
                attempt = negotiation.attempts,
                "hash of received dependency does not match the requested one"
            );
            if negotiation.attempts >= MAX_DEPENDENCY_ATTEMPTS {
                let reason = format!(
                    "Dependency {client_path} did not match its hash after {MAX_DEPENDENCY_ATTEMPTS} attempts"
                );
                return self.refuse(&reason).await;
            }
            // Head stays in place, so the next reply still answers it
            return self.negotiate().await;
        }

        trace!(path, bytes = reply.content.len(), "received dependency");
        self.context.cache.put(&expected, &reply.content).await?;
        negotiation
            .environment
            .link_dependency_to_cache(&path, &expected, &self.context.cache)
            .await?;
        negotiation.order.complete_head();
        negotiation.attempts = 0;

        self.negotiate().await
    }

    async fn compile(&mut self) -> Result<()> {
        let State::Negotiating(Negotiation {
            arguments,
            environment,
            ..
        }) = std::mem::replace(&mut self.state, State::Closed)
        else {
            return Ok(());
        };

        let compression = environment.compression();
        let started = Instant::now();
        info!(compiler = arguments.compiler(), "compiling");

        let outcome = environment
            .do_compilation(&arguments, wait_for_disconnect(&self.stream))
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(EnvError::ClientDisconnected) => {
                warn!("client disconnected during compilation");
                environment.remove().await;
                return Ok(());
            }
            Err(EnvError::CompilationTimeout { timeout }) => {
                error!(secs = timeout.as_secs(), "compilation timed out");
                CompilationResultMessage::failure(
                    format!("Remote compilation is limited to {}s.", timeout.as_secs()),
                    EX_TEMPFAIL,
                    compression,
                )
            }
            Err(e) => {
                error!(error = %e, "compiler invocation failed");
                CompilationResultMessage::failure(
                    format!("Invocation of compiler failed:\n{e}"),
                    EX_IOERR,
                    compression,
                )
            }
        };

        info!(
            return_code = result.return_code,
            objects = result.object_files.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compilation finished"
        );
        let sent = self.send(result.into()).await;
        environment.remove().await;
        sent
    }
}

/// Resolves once the client has closed its side (or the socket failed).
async fn wait_for_disconnect(stream: &TcpStream) {
    let mut peeked = [0u8; 1];
    loop {
        match stream.peek(&mut peeked).await {
            Ok(0) | Err(_) => return,
            Ok(_) => tokio::time::sleep(DISCONNECT_POLL_INTERVAL).await,
        }
    }
}

fn outside_workspace_reason(path: &str) -> String {
    format!("Path '{path}' can not be mapped into the server's workspace")
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}
