#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Basic usage example for `switchy_barrier`
//!
//! A handful of worker threads run until shutdown is requested. Shutdown is requested by
//! whichever happens first: Ctrl+C, a timer, or any worker exiting. Each source falls its own
//! barrier and forwards it into the shared shutdown barrier.
//!
//! Configuration:
//!
//! * `WORKERS`: number of worker threads (default `4`)
//! * `SHUTDOWN_AFTER_SECS`: seconds before the timer requests shutdown (default `3`)
//! * `RUST_LOG`: log filter, e.g. `RUST_LOG=switchy_barrier=trace`

use std::{
    str::FromStr,
    thread,
    time::{Duration, Instant},
};

use switchy_barrier::Barrier;

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, T::Err> {
    std::env::var(name)
        .ok()
        .map(|value| value.parse())
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let workers: usize = env_or("WORKERS", 4)?;
    let shutdown_after = Duration::from_secs(env_or("SHUTDOWN_AFTER_SECS", 3)?);

    println!("=== Switchy Barrier Example ===\n");

    let started = Instant::now();
    let shutdown = Barrier::new().with_on_fall(move || {
        println!("🛑 Shutdown requested after {:?}", started.elapsed());
    });

    let interrupted = Barrier::new().with_on_fall(|| println!("⌨️  Ctrl+C received"));
    let deadline = Barrier::new().with_on_fall(|| println!("⏰ Timer expired"));
    interrupted.forward(&shutdown);
    deadline.forward(&shutdown);

    ctrlc::set_handler({
        let interrupted = interrupted.clone();
        move || interrupted.fall()
    })?;

    thread::spawn({
        let deadline = deadline.clone();
        move || {
            thread::sleep(shutdown_after);
            deadline.fall();
        }
    });

    let handles = (0..workers)
        .map(|id| {
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || {
                    // If any worker exits, they all exit
                    let _guard = shutdown.fall_on_drop();
                    let mut ticks = 0_u64;
                    while !shutdown.is_fallen() {
                        ticks += 1;
                        log::debug!("worker-{id}: tick {ticks}");
                        thread::sleep(Duration::from_millis(100));
                    }
                    ticks
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    println!("🚀 Started {workers} worker(s). Press Ctrl+C to stop early.");

    shutdown.wait();

    for (id, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(ticks) => println!("   worker-{id} stopped after {ticks} tick(s)"),
            Err(_) => println!("   worker-{id} panicked"),
        }
    }

    println!(
        "\nShutdown source: {}",
        if interrupted.is_fallen() {
            "Ctrl+C"
        } else if deadline.is_fallen() {
            "timer"
        } else {
            "worker exit"
        }
    );

    Ok(())
}
