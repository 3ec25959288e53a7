use std::sync::Arc;
use std::thread;

use netbase_frame::{DatagramTransport, Framing};
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, DatagramArgs};
use crate::exit::{transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: DatagramArgs, format: OutputFormat) -> CliResult<i32> {
    let transport = Arc::new(
        DatagramTransport::new(args.endpoint.config())
            .map_err(|err| transport_error("invalid endpoint", err))?,
    );
    transport
        .open()
        .map_err(|err| transport_error("open failed", err))?;
    transport
        .set_destination(&args.peer, args.peer_port)
        .map_err(|err| transport_error("invalid destination", err))?;
    if let Some(bound) = transport.endpoint().bound_address() {
        info!(address = %bound, destination = ?transport.destination(), "datagram endpoint ready");
    }

    {
        let transport = Arc::clone(&transport);
        install_ctrlc_handler(move || {
            if let Err(err) = transport.close() {
                warn!(error = %err, "close failed");
            }
        })?;
    }

    let receive_forever = args.data.is_empty() && args.count.is_none();
    let receiver = (receive_forever || args.count.is_some()).then(|| {
        let transport = Arc::clone(&transport);
        let limit = args.count;
        thread::Builder::new()
            .name("netbase-datagram-rx".to_string())
            .spawn(move || receive_loop(&transport, limit, format))
    });
    let receiver = receiver
        .transpose()
        .map_err(|err| CliError::new(INTERNAL, format!("failed to spawn receiver: {err}")))?;

    for message in &args.data {
        let sent = transport
            .send_str(message)
            .map_err(|err| transport_error("send failed", err))?;
        if !sent {
            break;
        }
    }

    if let Some(receiver) = receiver {
        if receiver.join().is_err() {
            return Err(CliError::new(INTERNAL, "receiver thread panicked"));
        }
    }
    transport
        .close()
        .map_err(|err| transport_error("close failed", err))?;
    Ok(SUCCESS)
}

/// Print incoming messages until `limit` is reached or the endpoint closes.
fn receive_loop(transport: &DatagramTransport, limit: Option<usize>, format: OutputFormat) {
    let mut received = 0usize;
    while limit.is_none_or(|limit| received < limit) {
        match transport.receive_message() {
            Ok(Some(message)) => {
                let source = transport
                    .destination()
                    .map(|address| address.to_string())
                    .unwrap_or_default();
                print_message(&source, &message, format);
                received += 1;
            }
            Ok(None) => break,
            Err(_) if !transport.is_running() => break,
            Err(err) => {
                // Datagram pairs can arrive torn; keep listening.
                debug!(error = %err, "dropping malformed datagram");
            }
        }
    }
}
