use fmq::{CancelToken, Error, OpenMode, PollSettings, Queue, QueueConfig, ReadOutcome};
use log::{info, warn};
use std::time::Duration;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: {} <config.toml> [cursor name]", args[0]);
        std::process::exit(2);
    }
    let config = QueueConfig::load(&args[1]).expect("Load config");
    env_logger::Builder::new()
        .filter_level(config.level_filter().expect("Log level"))
        .init();

    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || handler_cancel.cancel()).expect("Set Ctrl-C handler");

    let settings = PollSettings::new(Duration::from_millis(500)).with_cancel(cancel.clone());
    let mut beat: fmq::Heartbeat = Box::new(|label| info!("still {}", label));
    let opened = Queue::open_blocking(
        &config.path,
        OpenMode::ReadOnly,
        config.options(),
        &settings,
        Some(&mut beat),
    );
    let queue = match opened {
        Ok(queue) => queue,
        Err(Error::Cancelled) => return,
        Err(e) => panic!("Open queue: {}", e),
    };
    let mut reader = match args.get(2) {
        Some(name) => queue.named_reader(name).expect("Open named cursor"),
        None => queue.reader(),
    };
    reader.set_cancel(cancel);

    loop {
        match reader.next(Some(Duration::new(1, 0))) {
            Ok(ReadOutcome::Message(msg)) => {
                info!(
                    "{} type {} time {}: {}",
                    msg.id,
                    msg.msg_type,
                    msg.time,
                    String::from_utf8_lossy(&msg.payload)
                );
            }
            Ok(ReadOutcome::DataLoss { skipped, resume_from }) => {
                warn!("lost {} messages, resuming at {}", skipped, resume_from);
            }
            Ok(ReadOutcome::TimedOut) | Ok(ReadOutcome::NoData) => {
                info!("Timeout");
            }
            Err(Error::Cancelled) => break,
            Err(e @ Error::CorruptMessage { .. }) => warn!("{}", e),
            Err(e) => panic!("Read failed: {}", e),
        }
    }
}
