use std::io::{self, BufRead};
use std::sync::Arc;

use netbase_frame::Framing;
use netbase_peer::StreamClient;
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, ConnectArgs};
use crate::exit::{io_error, transport_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: ConnectArgs, format: OutputFormat) -> CliResult<i32> {
    let client = Arc::new(
        StreamClient::new(args.endpoint.config())
            .map_err(|err| transport_error("invalid endpoint", err))?,
    );
    client
        .connect()
        .map_err(|err| transport_error("connect failed", err))?;
    let peer = client.peer().to_string();
    info!(%peer, "connected");

    {
        let client = Arc::clone(&client);
        install_ctrlc_handler(move || {
            if let Err(err) = client.disconnect() {
                warn!(error = %err, "disconnect failed");
            }
        })?;
    }

    let messages: Box<dyn Iterator<Item = io::Result<String>>> = if args.data.is_empty() {
        Box::new(io::stdin().lock().lines())
    } else {
        Box::new(args.data.into_iter().map(Ok))
    };

    for line in messages {
        let line = line.map_err(|err| io_error("read stdin failed", &err))?;
        if line.is_empty() {
            continue;
        }
        let sent = client
            .send_str(&line)
            .map_err(|err| transport_error("send failed", err))?;
        if !sent {
            // Disconnected by Ctrl-C.
            break;
        }
        if args.no_wait {
            continue;
        }

        match client.receive_message() {
            Ok(Some(reply)) => print_message(&peer, &reply, format),
            Ok(None) => break,
            Err(err) if err.is_disconnect() => {
                return Err(CliError::new(FAILURE, "server closed the connection"));
            }
            Err(err) => return Err(transport_error("receive failed", err)),
        }
    }

    client
        .disconnect()
        .map_err(|err| transport_error("disconnect failed", err))?;
    Ok(SUCCESS)
}
