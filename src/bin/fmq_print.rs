use fmq::{OpenMode, Queue, QueueOptions};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <queue path>", args[0]);
        std::process::exit(2);
    }
    let queue = Queue::open_unvalidated(&args[1], OpenMode::ReadOnly, QueueOptions::default())
        .expect("Open queue");
    let mut out = std::io::stdout().lock();
    queue.dump(&mut out).expect("Dump queue");
    if let Ok(usage) = queue.usage() {
        println!(
            "{} of {} slots, {} of {} bytes, {:.1}% used",
            usage.active_slots,
            usage.n_slots,
            usage.active_bytes,
            usage.buffer_size,
            usage.fraction_used() * 100.0
        );
    }
}
