//! Pretends to be a pair of glasses on the network, for testing gazecontrol
//! without the hardware.

use clap::Parser;
use gazecontrol::{args::SimArgs, dummy_glasses::DummyGlasses};
use log::info;
use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::sleep,
    time::Duration,
};

// Example:
// cargo run --bin glasses-sim -- --listen 127.0.0.1:49152 --rate 50

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = SimArgs::parse();

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::SeqCst))?;

    let mut glasses = DummyGlasses::with_rate(args.listen, args.rate, args.noise)?;
    println!("Simulated glasses listening on {}", glasses.local_addr());

    while !stop.load(Ordering::SeqCst) {
        sleep(Duration::from_secs(1));
        info!(
            "{} subscription requests, {} samples sent",
            glasses.keepalives(),
            glasses.samples_sent()
        );
    }

    glasses.stop();
    Ok(())
}
