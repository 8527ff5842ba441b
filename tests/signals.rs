//! Property 7 (signal coalescing): repeated delivery of one signal number
//! never starves a distinct signal number, and no signal increments its
//! action more times than it was actually raised.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use daemond::signals::{Dispatcher, Signal};

#[tokio::test]
async fn rapid_repeats_are_not_lost_across_signals() {
    let usr1_count = Arc::new(AtomicUsize::new(0));
    let usr2_count = Arc::new(AtomicUsize::new(0));

    let dispatcher = Dispatcher::builder()
        .on(Signal::Usr1, {
            let c = Arc::clone(&usr1_count);
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on(Signal::Usr2, {
            let c = Arc::clone(&usr2_count);
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            }
        })
        .spawn()
        .expect("install signal handlers");

    let pid = nix::unistd::Pid::this();
    const RAISES: usize = 20;
    for i in 0..RAISES {
        let sig = if i % 2 == 0 {
            nix::sys::signal::Signal::SIGUSR1
        } else {
            nix::sys::signal::Signal::SIGUSR2
        };
        nix::sys::signal::kill(pid, sig).expect("raise signal");
    }

    // Give the dispatcher task a chance to drain the self-pipe.
    tokio::time::sleep(Duration::from_millis(200)).await;
    dispatcher.shutdown();

    let usr1 = usr1_count.load(Ordering::SeqCst);
    let usr2 = usr2_count.load(Ordering::SeqCst);

    // Coalescing may drop some repeats of the *same* number under rapid-fire
    // delivery, but neither signal may be starved entirely by the other, and
    // neither can fire more often than it was actually raised.
    assert!(usr1 >= 1 && usr1 <= RAISES / 2);
    assert!(usr2 >= 1 && usr2 <= RAISES / 2);
}
