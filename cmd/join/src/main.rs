//! Two-node join demo.
//!
//! A root and a leaf share a simulated radio hub; the leaf runs the
//! Locate/Link handshake and hangs itself off the root. Timing is scaled
//! down 20x so the whole thing takes a couple of seconds.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use treelink::{Mac, NetConfig, NetStack};

fn main() {
    println!("=== treelink join demo ===\n");

    let config = NetConfig::from_env().scaled_down(20);
    config.dump();

    let hub = treelink::SimHub::start();
    let radio_a = Arc::new(hub.endpoint(Mac([0xAA, 0, 0, 0, 0, 0x01])));
    let radio_b = Arc::new(hub.endpoint(Mac([0xBB, 0, 0, 0, 0, 0x02])));

    let root = NetStack::new(0x16, true, config.clone(), radio_a).expect("root init");
    let leaf = NetStack::new(0x17, false, config, radio_b).expect("leaf init");

    println!("\nwaiting for the leaf to locate the root...");
    while leaf.upstream_id().is_none() {
        thread::sleep(Duration::from_millis(50));
    }

    println!("\nroot link table:");
    for (slot, id, mac) in root.table() {
        println!("  {} {:02X} {}", slot, id, mac);
    }
    println!("leaf link table:");
    for (slot, id, mac) in leaf.table() {
        println!("  {} {:02X} {}", slot, id, mac);
    }

    println!("\nleaf upstream: 0x{:02X}", leaf.upstream_id().unwrap());
    println!("root downstream: {:?}", root.downstream());

    leaf.shutdown();
    root.shutdown();
    hub.stop();
    println!("\ndone.");
}
