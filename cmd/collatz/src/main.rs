//! Distributed Collatz demo: a root and two workers share one integer
//! frame over the simulated hub.
//!
//! Block sizes are shrunk so the frame visibly advances within seconds;
//! the real deployment grinds four-million-integer blocks above 2^68.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use treelink::{Collatz, CollatzConfig, Mac, NetConfig, NetStack};

fn main() {
    println!("=== treelink collatz demo ===\n");

    let net_config = NetConfig::from_env().scaled_down(20);
    let job_config = CollatzConfig {
        blocks: 8,
        block_size: 1 << 10,
        start_from_one: false,
        startup_delay: Duration::from_millis(200),
        receive_timeout: Duration::from_millis(500),
        ..CollatzConfig::default()
    };

    let hub = treelink::SimHub::start();
    let radio_a = Arc::new(hub.endpoint(Mac([0xAA, 0, 0, 0, 0, 0x01])));
    let radio_b = Arc::new(hub.endpoint(Mac([0xBB, 0, 0, 0, 0, 0x02])));
    let radio_c = Arc::new(hub.endpoint(Mac([0xCC, 0, 0, 0, 0, 0x03])));

    let root = NetStack::new(0x16, true, net_config.clone(), radio_a).expect("root init");
    let w1 = NetStack::new(0x17, false, net_config.clone(), radio_b).expect("worker init");
    let w2 = NetStack::new(0x18, false, net_config, radio_c).expect("worker init");

    while w1.upstream_id().is_none() || w2.upstream_id().is_none() {
        thread::sleep(Duration::from_millis(50));
    }
    println!("tree formed: root 0x16, workers 0x17 0x18\n");

    let verifiers = [
        Collatz::spawn(&root, job_config.clone()).expect("spawn"),
        Collatz::spawn(&w1, job_config.clone()).expect("spawn"),
        Collatz::spawn(&w2, job_config).expect("spawn"),
    ];

    for round in 1..=5 {
        thread::sleep(Duration::from_secs(1));
        println!("--- after {}s ---", round);
        for (node, v) in ["root", "w1  ", "w2  "].iter().zip(&verifiers) {
            let (base, blocks) = v.snapshot();
            let rendered: String = blocks
                .iter()
                .map(|b| match b {
                    treelink::BlockState::Free => '_',
                    treelink::BlockState::Taken => '+',
                    treelink::BlockState::Done => 'X',
                })
                .collect();
            println!("  {} frame {} [{}]", node, base, rendered);
        }
    }

    for v in &verifiers {
        v.stop();
    }
    w2.shutdown();
    w1.shutdown();
    root.shutdown();
    hub.stop();
    println!("\ndone.");
}
