//! Bounce demo: a message ping-pongs between a root and a leaf.
//!
//! Watch the per-hop log lines (set `TL_LOG_LEVEL=info`): each re-emission
//! increments the counter and stamps the re-emitter's node id until the
//! lifespan runs out.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use treelink::{Bounce, Mac, NetConfig, NetStack};

fn main() {
    println!("=== treelink bounce demo ===\n");

    let config = NetConfig::from_env().scaled_down(20);

    let hub = treelink::SimHub::start();
    let radio_a = Arc::new(hub.endpoint(Mac([0xAA, 0, 0, 0, 0, 0x01])));
    let radio_b = Arc::new(hub.endpoint(Mac([0xBB, 0, 0, 0, 0, 0x02])));

    let root = NetStack::new(0x16, true, config.clone(), radio_a).expect("root init");
    let leaf = NetStack::new(0x17, false, config, radio_b).expect("leaf init");

    while leaf.upstream_id().is_none() {
        thread::sleep(Duration::from_millis(50));
    }
    println!("leaf joined, starting bounce apps\n");

    let cycle = Duration::from_millis(500);
    let _root_bounce = Bounce::init(&root, cycle).expect("bounce init");
    let leaf_bounce = Bounce::init(&leaf, cycle).expect("bounce init");

    leaf_bounce.send_up("hello, tree!", 6).expect("inject");

    // Six hops at half a second each, plus slack.
    thread::sleep(Duration::from_secs(5));

    leaf.shutdown();
    root.shutdown();
    hub.stop();
    println!("done.");
}
