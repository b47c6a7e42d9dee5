use fmq::{CancelToken, Error, OutboundMessage, QueueConfig};
use log::{info, warn};
use std::time::Duration;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: {} <config.toml> [interval_ms]", args[0]);
        std::process::exit(2);
    }
    let config = QueueConfig::load(&args[1]).expect("Load config");
    let interval = match args.get(2) {
        Some(ms) => Duration::from_millis(ms.parse().expect("Interval in milliseconds")),
        None => Duration::from_millis(100),
    };
    env_logger::Builder::new()
        .filter_level(config.level_filter().expect("Log level"))
        .init();

    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || handler_cancel.cancel()).expect("Set Ctrl-C handler");

    let queue = config.open_queue().expect("Open queue");
    let mut writer = queue.writer();
    writer.set_write_timeout(config.write_timeout());
    writer.set_cancel(cancel.clone());
    writer.set_heartbeat(Box::new(|label| info!("still {}", label)));

    let mut count: u64 = 0;
    while !cancel.is_cancelled() {
        let payload = format!("hello {}", count);
        // time is left for the writer to stamp
        let msg = OutboundMessage::new(1, payload.as_bytes()).with_compression(config.compress);
        match writer.append(&msg) {
            Ok(id) => info!("wrote message {}", id),
            Err(Error::Cancelled) => break,
            Err(e @ Error::WriteTimedOut { .. }) => warn!("{}", e),
            Err(e) => panic!("Write failed: {}", e),
        }
        count += 1;
        std::thread::sleep(interval);
    }
    info!("stopping after {} messages", count);
}
