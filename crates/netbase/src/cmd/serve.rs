use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netbase_frame::Framing;
use netbase_peer::{ServerConfig, StreamServer};
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, ServeArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

/// Pause before retrying accept while every client slot is taken.
const FULL_BACKOFF: Duration = Duration::from_millis(50);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = ServerConfig::new(args.endpoint.config(), args.max_connections);
    let server =
        Arc::new(StreamServer::new(config).map_err(|err| peer_error("invalid endpoint", err))?);
    server
        .start()
        .map_err(|err| peer_error("server start failed", err))?;
    if let Some(bound) = server.bound_address() {
        info!(address = %bound, max_connections = args.max_connections, "listening");
    }

    {
        let server = Arc::clone(&server);
        install_ctrlc_handler(move || {
            if let Err(err) = server.stop() {
                warn!(error = %err, "server stop failed");
            }
        })?;
    }

    let reply: Arc<str> = Arc::from(args.reply.as_str());
    let answered = Arc::new(AtomicUsize::new(0));
    while server.is_running() {
        let task = EchoTask {
            server: Arc::clone(&server),
            reply: Arc::clone(&reply),
            answered: Arc::clone(&answered),
            limit: args.count,
            format,
        };
        match server.accept_and_dispatch(move || task.run()) {
            Ok(Some(handle)) => debug!(client = %handle, "client dispatched"),
            // Full registry, or stop() closed the listener.
            Ok(None) if server.is_running() => thread::sleep(FULL_BACKOFF),
            Ok(None) => break,
            Err(err) => return Err(peer_error("accept failed", err)),
        }
    }

    server
        .stop()
        .map_err(|err| peer_error("server stop failed", err))?;
    Ok(SUCCESS)
}

/// Per-connection handler run on a pool worker.
struct EchoTask {
    server: Arc<StreamServer>,
    reply: Arc<str>,
    answered: Arc<AtomicUsize>,
    limit: Option<usize>,
    format: OutputFormat,
}

impl EchoTask {
    fn run(self) {
        let Some(connection) = self.server.claim_next_handle() else {
            return;
        };
        let peer = connection.peer().to_string();
        info!(client = %connection.handle(), %peer, "serving client");

        while connection.is_connected() {
            let message = match connection.receive_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) if err.is_disconnect() => {
                    debug!(client = %connection.handle(), "client hung up");
                    break;
                }
                Err(err) => {
                    warn!(client = %connection.handle(), error = %err, "receive failed");
                    break;
                }
            };

            print_message(&peer, &message, self.format);
            if let Err(err) = connection.send_str(&self.reply) {
                warn!(client = %connection.handle(), error = %err, "reply failed");
                break;
            }

            let answered = self.answered.fetch_add(1, Ordering::SeqCst) + 1;
            if self.limit.is_some_and(|limit| answered >= limit) {
                info!(answered, "message limit reached");
                if let Err(err) = self.server.stop() {
                    warn!(error = %err, "server stop failed");
                }
                break;
            }
        }
    }
}
