//! The socket front end.
//!
//! One listener serves one controller at a time. The first line a client
//! sends picks the protocol; when the controller goes away the listener
//! waits for the next one while the program keeps its state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use snag_config::{Config, OpenMode};
use snag_core::{
    EngineEvent, EngineHandle, Input, ProtocolReply, Transport, TransportError, TransportFactory,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use crate::error::UiError;
use crate::link::{Incoming, Link, Outgoing};
use crate::{cdp, dap, line};

/// Width assumed until a client reports one.
const DEFAULT_WIDTH: usize = 80;

/// How long `quit` waits for the controller to receive the last output.
const QUIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Protocol version exchanged in the line-protocol greeting.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where and how to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTarget {
    pub mode: OpenMode,
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
}

impl OpenTarget {
    /// The configured listener.
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.remote.open.unwrap_or(OpenMode::Tcp),
            host: config.remote.host.clone(),
            port: config.remote.port.unwrap_or(0),
        }
    }

    /// Parse the argument of `open`: empty, a mode name, `host:port` or a
    /// port.
    pub fn parse(arg: &str, config: &Config) -> Result<Self, UiError> {
        let mut target = Self::from_config(config);
        match arg.trim() {
            "" => {}
            "tcp" => target.mode = OpenMode::Tcp,
            "vscode" => target.mode = OpenMode::Vscode,
            "chrome" => target.mode = OpenMode::Chrome,
            other => {
                let (host, port) = match other.rsplit_once(':') {
                    Some((host, port)) => (Some(host), port),
                    None => (None, other),
                };
                let port = port
                    .parse::<u16>()
                    .map_err(|_| UiError::UnknownFrontEnd(other.to_string()))?;
                target.mode = OpenMode::Tcp;
                target.port = port;
                if let Some(host) = host.filter(|h| !h.is_empty()) {
                    target.host = host.to_string();
                }
            }
        }
        Ok(target)
    }
}

/// What the connection tasks need to know about this listener.
#[derive(Debug)]
pub(crate) struct Settings {
    pub(crate) cookie: Option<String>,
    pub(crate) addr: SocketAddr,
    pub(crate) session_name: String,
}

/// A [`Transport`] served over TCP.
pub struct RemoteTransport {
    name: String,
    addr: SocketAddr,
    link: Arc<Link>,
    incoming: UnboundedReceiver<Incoming>,
    runtime: Option<Runtime>,
}

impl RemoteTransport {
    /// Listen where the configuration says.
    pub fn bind(config: &Config) -> Result<Self, UiError> {
        Self::bind_to(OpenTarget::from_config(config), config)
    }

    pub fn bind_to(target: OpenTarget, config: &Config) -> Result<Self, UiError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("snag-remote")
            .enable_all()
            .build()?;
        let listener = runtime.block_on(TcpListener::bind((target.host.as_str(), target.port)))?;
        let addr = listener.local_addr()?;
        let (link, incoming) = Link::new(DEFAULT_WIDTH);
        let link = Arc::new(link);
        let settings = Arc::new(Settings {
            cookie: config.remote.cookie.clone(),
            addr,
            session_name: config
                .remote
                .session_name
                .clone()
                .unwrap_or_else(|| format!("snag-{}", std::process::id())),
        });
        tracing::info!("listening on {} ({})", addr, target.mode.as_str());
        if target.mode == OpenMode::Chrome {
            tracing::info!("devtools: {}", cdp::devtools_url(&settings));
        }
        runtime.spawn(accept_loop(listener, Arc::clone(&link), settings));
        runtime.spawn(watch_interrupts(Arc::clone(&link)));
        Ok(Self {
            name: format!("{} {}", target.mode.as_str(), addr),
            addr,
            link,
            incoming,
            runtime: Some(runtime),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn wait(&mut self) -> Option<Incoming> {
        self.incoming.blocking_recv()
    }
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Transport for RemoteTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn puts(&mut self, text: &str) {
        for line in text.lines() {
            self.link.send(Outgoing::Out(line.to_string()));
        }
    }

    fn readline(&mut self, prompt: &str) -> Result<Input, TransportError> {
        self.link.begin_turn(prompt, false);
        let result = loop {
            match self.wait() {
                Some(Incoming::Input(input)) => break Ok(input),
                Some(Incoming::Answer(_)) => continue,
                Some(Incoming::Interrupt) => break Err(TransportError::Interrupted),
                None => break Err(TransportError::Closed),
            }
        };
        self.link.end_turn();
        result
    }

    fn ask(&mut self, prompt: &str, default: &str) -> Result<String, TransportError> {
        self.link.begin_turn(prompt, true);
        let result = loop {
            match self.wait() {
                Some(Incoming::Answer(answer) | Incoming::Input(Input::Line(answer))) => {
                    let answer = match answer.trim() {
                        "" => default,
                        given => given,
                    };
                    break Ok(answer.to_string());
                }
                Some(Incoming::Input(Input::Request { id, .. })) => {
                    self.link.send(Outgoing::Reply {
                        id,
                        reply: Err("busy".to_string()),
                    });
                }
                Some(Incoming::Interrupt) => break Err(TransportError::Interrupted),
                None => break Err(TransportError::Closed),
            }
        };
        self.link.end_turn();
        result
    }

    fn event(&mut self, event: EngineEvent) {
        self.link.send(Outgoing::Event(event));
    }

    fn respond(&mut self, id: u64, reply: Result<ProtocolReply, String>) {
        self.link.send(Outgoing::Reply { id, reply });
    }

    fn width(&self) -> usize {
        self.link.width()
    }

    fn quit(&mut self, code: i32) {
        self.link.send(Outgoing::Quit(code));
        let (tx, rx) = oneshot::channel();
        self.link.send(Outgoing::Flush(tx));
        if let Some(runtime) = &self.runtime {
            let _ = runtime.block_on(async { tokio::time::timeout(QUIT_FLUSH_TIMEOUT, rx).await });
        }
    }

    fn activate(&mut self, handle: EngineHandle) {
        self.link.activate(handle);
    }
}

/// Accept controllers one after another.
async fn accept_loop(listener: TcpListener, link: Arc<Link>, settings: Arc<Settings>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        tracing::info!("controller connected from {}", peer);
        match serve(stream, &link, &settings).await {
            Ok(()) => tracing::info!("controller {} disconnected", peer),
            Err(e) => tracing::warn!("controller {}: {}", peer, e),
        }
        link.disconnect();
    }
}

/// Ctrl-C pauses the program, or interrupts a pending prompt.
async fn watch_interrupts(link: Arc<Link>) {
    while tokio::signal::ctrl_c().await.is_ok() {
        tracing::debug!("interrupt");
        link.interrupt();
    }
}

/// Detect the protocol from the first line and hand the connection over.
async fn serve(stream: TcpStream, link: &Arc<Link>, settings: &Settings) -> Result<(), UiError> {
    let (read, write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut first = String::new();
    if reader.read_line(&mut first).await? == 0 {
        return Ok(());
    }
    if first.starts_with("version:") {
        line::serve(&first, reader, write, link, settings).await
    } else if first.starts_with("Content-Length:") {
        dap::serve(&first, reader, write, link).await
    } else if first.starts_with("GET ") {
        cdp::serve(&first, reader, write, link, settings).await
    } else {
        Err(UiError::Handshake(format!(
            "unrecognized greeting {:?}",
            first.trim_end()
        )))
    }
}

/// Opens [`RemoteTransport`]s for the `open` command.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteFactory;

impl TransportFactory for RemoteFactory {
    fn open(&self, spec: &str, config: &Config) -> Result<Box<dyn Transport>, TransportError> {
        let target = OpenTarget::parse(spec, config)?;
        Ok(Box::new(RemoteTransport::bind_to(target, config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_arguments() {
        let mut config = Config::default();
        config.remote.port = Some(4000);
        let t = OpenTarget::parse("", &config).unwrap();
        assert_eq!((t.mode, t.host.as_str(), t.port), (OpenMode::Tcp, "127.0.0.1", 4000));
        assert_eq!(OpenTarget::parse("chrome", &config).unwrap().mode, OpenMode::Chrome);
        let t = OpenTarget::parse("0.0.0.0:5000", &config).unwrap();
        assert_eq!((t.host.as_str(), t.port), ("0.0.0.0", 5000));
        assert_eq!(OpenTarget::parse("5001", &config).unwrap().port, 5001);
        assert!(matches!(
            OpenTarget::parse("ftp", &config),
            Err(UiError::UnknownFrontEnd(_))
        ));
    }

    #[test]
    fn binds_an_ephemeral_port() {
        let transport = RemoteTransport::bind(&Config::default()).unwrap();
        assert_ne!(transport.local_addr().port(), 0);
        assert!(transport.name().starts_with("tcp 127.0.0.1:"));
        assert_eq!(transport.width(), DEFAULT_WIDTH);
    }

    #[test]
    fn factory_opens_a_listener() {
        let transport = RemoteFactory.open("vscode", &Config::default()).unwrap();
        assert!(transport.name().starts_with("vscode "));
    }
}
