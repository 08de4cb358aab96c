//! Distributed Collatz verification.
//!
//! Peers cooperate on a shared integer frame: `BLOCKS` consecutive blocks
//! of `BLOCKSIZE` integers starting at `base`, the global blocks-done
//! offset. Everything below the frame is verified; each node picks free
//! blocks, grinds them with the fused `(3n+1)/2^k` step, and gossips
//! Taken/Done reports so the frame advances in lockstep across the tree.
//!
//! Two tasks share one mutex-guarded job: the communication task receives
//! and reconciles reports, the computation task does the long arithmetic
//! with the mutex released.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use treelink_core::bigint::{BigInt, Overflow, INT_LEN, LIMB_MASK};
use treelink_core::frame::AppHeader;
use treelink_core::logging;
use treelink_core::{loge, logi, logw, NetError, NetResult};
use treelink_net::stack::NetStack;

const TAG: &str = "collatz";

/// Default application id; deployments may configure another.
pub const APP_COLLATZ_ID: u16 = 32;

/// Wire size of one report: magic, type, block id, base.
pub const REPORT_LEN: usize = 4 + 2 + 2 + 4 + 4 * INT_LEN;

const REPORT_MAGIC: [u8; 4] = *b"f3n1";

/// Report-type bit marking a frame traveling toward the root.
const REPORT_UP: i16 = 0x8;

/// Mask extracting the block state from the report type.
const REPORT_MASK: i16 = 0x3;

/// Per-block progress; reconciliation merges with `max`, so the order
/// matters: Free < Taken < Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BlockState {
    Free = 0,
    Taken = 1,
    Done = 2,
}

impl BlockState {
    fn from_i16(v: i16) -> BlockState {
        match v {
            1 => BlockState::Taken,
            2 => BlockState::Done,
            _ => BlockState::Free,
        }
    }
}

/// One progress report, as gossiped between peers.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub state: BlockState,
    pub up: bool,
    /// Block the report concerns, or -1 for none.
    pub block_id: i16,
    pub base: BigInt,
}

impl Report {
    pub fn encode(&self) -> [u8; REPORT_LEN] {
        let mut out = [0u8; REPORT_LEN];
        out[0..4].copy_from_slice(&REPORT_MAGIC);
        let mut rt = self.state as i16;
        if self.up {
            rt |= REPORT_UP;
        }
        out[4..6].copy_from_slice(&rt.to_le_bytes());
        out[6..8].copy_from_slice(&self.block_id.to_le_bytes());
        out[8..12].copy_from_slice(&(self.base.len() as u32).to_le_bytes());
        for (i, limb) in self.base.limbs().iter().enumerate() {
            let at = 12 + 4 * i;
            out[at..at + 4].copy_from_slice(&limb.to_le_bytes());
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Option<Report> {
        if payload.len() != REPORT_LEN || payload[0..4] != REPORT_MAGIC {
            return None;
        }
        let rt = i16::from_le_bytes(payload[4..6].try_into().ok()?);
        let block_id = i16::from_le_bytes(payload[6..8].try_into().ok()?);
        let len = u32::from_le_bytes(payload[8..12].try_into().ok()?);
        let mut limbs = [0u32; INT_LEN];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let at = 12 + 4 * i;
            *limb = u32::from_le_bytes(payload[at..at + 4].try_into().ok()?);
        }
        Some(Report {
            state: BlockState::from_i16(rt & REPORT_MASK),
            up: rt & REPORT_UP != 0,
            block_id,
            base: BigInt::from_raw(len, limbs),
        })
    }
}

/// Verifier knobs. The field defaults carry the 2^68 frontier and blocks
/// of about four million integers; tests shrink both.
#[derive(Debug, Clone)]
pub struct CollatzConfig {
    pub app_id: u16,
    /// Blocks per frame.
    pub blocks: usize,
    /// Integers per block; must be even.
    pub block_size: u32,
    /// Start from 1 instead of the verified frontier.
    pub start_from_one: bool,
    /// Grace period before the computation task starts.
    pub startup_delay: Duration,
    /// Communication task receive timeout (also bounds shutdown latency).
    pub receive_timeout: Duration,
}

impl Default for CollatzConfig {
    fn default() -> Self {
        Self {
            app_id: APP_COLLATZ_ID,
            blocks: 32,
            block_size: 1 << 22,
            start_from_one: false,
            startup_delay: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(4),
        }
    }
}

impl CollatzConfig {
    /// The starting offset: 1, or the frontier just under 2^68.
    fn start_base(&self) -> BigInt {
        if self.start_from_one {
            BigInt::from_u32(1)
        } else {
            BigInt::from_limbs(&[LIMB_MASK, LIMB_MASK, 0xFF])
        }
    }
}

/// The frame state both tasks share. Pure of I/O: methods return the
/// report to gossip, the node wrapper does the sending.
struct JobState {
    blocks_n: usize,
    block_size: u32,
    base: BigInt,
    /// Block we are computing, in current-frame coordinates; -1 for none.
    block_id: i16,
    blocks: Vec<BlockState>,
    /// Sticky: any overflow ends this node's participation.
    overflow: bool,
}

impl JobState {
    fn new(cfg: &CollatzConfig) -> JobState {
        JobState {
            blocks_n: cfg.blocks,
            block_size: cfg.block_size,
            base: cfg.start_base(),
            block_id: -1,
            blocks: vec![BlockState::Free; cfg.blocks],
            overflow: false,
        }
    }

    /// Pick the next block to work on: free blocks weighted toward the
    /// front of the frame (earlier blocks unblock the shift). When nothing
    /// is free, block 0 -- someone probably abandoned it.
    fn pick_block(&self, rnd: u32) -> usize {
        let mut mass: u32 = 0;
        for (i, b) in self.blocks.iter().enumerate() {
            if *b == BlockState::Free {
                mass += (self.blocks_n - i) as u32;
            }
        }
        if mass > 0 {
            let mut rnd = rnd % mass;
            for (i, b) in self.blocks.iter().enumerate() {
                if *b != BlockState::Free {
                    continue;
                }
                let p = (self.blocks_n - i) as u32;
                if rnd < p {
                    return i;
                }
                rnd -= p;
            }
        }
        0
    }

    /// Slide the frame down by `done` blocks, backfilling Free and keeping
    /// the current block id on board when it survives the shift.
    fn shift_blocks(&mut self, done: usize) {
        if done < self.blocks_n {
            self.blocks.drain(..done);
            self.blocks.resize(self.blocks_n, BlockState::Free);
            if self.block_id >= done as i16 {
                self.block_id -= done as i16;
            } else {
                self.block_id = -1;
            }
        } else {
            self.blocks.fill(BlockState::Free);
            self.block_id = -1;
        }
    }

    /// `base + block_id * block_size`, the conditional-convergence mark
    /// the block's iterates must dip below.
    fn waterlevel(&self, block_id: usize) -> Result<BigInt, Overflow> {
        let mut w = self.base;
        for _ in 0..block_id {
            w.add(self.block_size)?;
        }
        Ok(w)
    }

    fn render(&self) -> String {
        self.blocks
            .iter()
            .map(|b| match b {
                BlockState::Free => '_',
                BlockState::Taken => '+',
                BlockState::Done => 'X',
            })
            .collect()
    }

    fn report(&self, state: BlockState) -> Report {
        Report {
            state,
            up: false,
            block_id: self.block_id,
            base: self.base,
        }
    }

    /// Advance the frame over every leading Done block. Returns a
    /// BLOCK_DONE report when anything advanced, or when `fin` marks the
    /// completion of an isolated block that still needs announcing.
    fn report_my_progress(&mut self, fin: bool) -> Option<Report> {
        if self.blocks[0] == BlockState::Done {
            if self.base.add(self.block_size).is_err() {
                self.overflow = true;
                return None;
            }
            let mut done = 1;
            while done < self.blocks_n && self.blocks[done] == BlockState::Done {
                if self.base.add(self.block_size).is_err() {
                    self.overflow = true;
                    return None;
                }
                done += 1;
            }
            self.shift_blocks(done);
            logi!(
                TAG,
                "Shifted {} blocks, the current frame is {}, and block {} (fin {})",
                done,
                self.base,
                self.block_id,
                fin
            );
            logi!(TAG, "  blocks: [{}]", self.render());
        } else if !fin {
            return None;
        } else {
            logi!(TAG, "Reporting block {} from frame {}", self.block_id, self.base);
        }
        Some(self.report(BlockState::Done))
    }

    /// Reconcile a peer's report with the local frame, then report any
    /// follow-up progress of our own.
    fn process_report(&mut self, rpt: &Report) -> Option<Report> {
        logi!(
            TAG,
            "Received a report for block {} frame {} ({:?})",
            rpt.block_id,
            rpt.base,
            rpt.state
        );

        let mut rpt = rpt.clone();
        match rpt.base.cmp(&self.base) {
            CmpOrdering::Less => {
                logi!(TAG, " - report is with a lower base");
                loop {
                    if rpt.block_id < 0 {
                        // Old news: the report predates the current frame.
                        return None;
                    }
                    if rpt.base.add(self.block_size).is_err() {
                        self.overflow = true;
                        return None;
                    }
                    rpt.block_id -= 1;
                    if rpt.base >= self.base {
                        break;
                    }
                }
                if rpt.base != self.base {
                    loge!(
                        TAG,
                        " - report base {} disagrees with frame base {} after shifting",
                        rpt.base,
                        self.base
                    );
                }
                logi!(TAG, " - new block id is {}", rpt.block_id);
            }
            CmpOrdering::Greater => {
                let mut left = self.blocks_n;
                loop {
                    if self.base.add(self.block_size).is_err() {
                        self.overflow = true;
                        return None;
                    }
                    left -= 1;
                    if left == 0 || rpt.base <= self.base {
                        break;
                    }
                }
                let advanced = self.blocks_n - left;
                logi!(TAG, " - raising the integer frame by {} blocks", advanced);
                self.shift_blocks(advanced);
                logi!(
                    TAG,
                    " - shifted {} blocks, frame is {}, and block {}",
                    advanced,
                    self.base,
                    self.block_id
                );
                logi!(TAG, "  blocks: [{}]", self.render());
                if left == 0 {
                    // The peer is a whole frame or more ahead: realign.
                    self.base = rpt.base;
                }
            }
            CmpOrdering::Equal => {}
        }

        if rpt.block_id >= 0 && (rpt.block_id as usize) < self.blocks_n {
            let bi = rpt.block_id as usize;
            if self.blocks[bi] < rpt.state {
                logi!(TAG, " - block {} state updated to {:?}", bi, rpt.state);
            }
            self.blocks[bi] = self.blocks[bi].max(rpt.state);
            if rpt.state == BlockState::Done && rpt.block_id == self.block_id {
                logi!(TAG, " - our current computation is obsolete");
                self.block_id = -1;
            }
        }

        self.report_my_progress(false)
    }
}

/// Grind one block: for every even offset in `(0, block_size]`, iterate
/// the fused step until the value dips to the waterlevel, then raise the
/// waterlevel past it. Returns whether the block ran to completion
/// (`false` on cancellation).
fn verify_block(
    mut waterlevel: BigInt,
    block_size: u32,
    cancel: &AtomicBool,
) -> Result<bool, Overflow> {
    let mut offset: u32 = 0;
    while offset < block_size {
        if cancel.load(Ordering::Acquire) {
            return Ok(false);
        }
        let mut n = waterlevel;
        n.add(2)?;
        loop {
            n.f3n1()?;
            n.fdiv2();
            if n <= waterlevel {
                break;
            }
        }
        waterlevel.add(2)?;
        offset += 2;
    }
    Ok(true)
}

/// The Collatz application on one node.
pub struct Collatz {
    stack: Arc<NetStack>,
    cfg: CollatzConfig,
    root: bool,
    job: Mutex<JobState>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Collatz {
    /// Register the app and start the communication and computation tasks.
    pub fn spawn(stack: &Arc<NetStack>, cfg: CollatzConfig) -> NetResult<Arc<Collatz>> {
        stack.register_app(cfg.app_id)?;

        let app = Arc::new(Collatz {
            stack: Arc::clone(stack),
            root: stack.is_root(),
            job: Mutex::new(JobState::new(&cfg)),
            cfg,
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        });

        let comm = {
            let app = Arc::clone(&app);
            thread::Builder::new()
                .name("collatz-comm".into())
                .spawn(move || app.comm_loop())
                .expect("failed to spawn collatz comm thread")
        };
        let comp = {
            let app = Arc::clone(&app);
            thread::Builder::new()
                .name("collatz-comp".into())
                .spawn(move || app.compute_loop())
                .expect("failed to spawn collatz compute thread")
        };
        app.threads.lock().unwrap().extend([comm, comp]);

        logi!(
            TAG,
            "verifier started{}",
            if app.root { " (root)" } else { "" }
        );
        Ok(app)
    }

    /// Stop both tasks. Blocks until they exit (bounded by the receive
    /// timeout and one offset step).
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        for h in self.threads.lock().unwrap().drain(..) {
            if h.thread().id() != thread::current().id() {
                let _ = h.join();
            }
        }
    }

    /// Current frame offset and block states.
    pub fn snapshot(&self) -> (BigInt, Vec<BlockState>) {
        let job = self.job.lock().unwrap();
        (job.base, job.blocks.clone())
    }

    pub fn overflowed(&self) -> bool {
        self.job.lock().unwrap().overflow
    }

    /// Roots flood reports down the tree; everyone else sends them up.
    fn broadcast(&self, mut rpt: Report) {
        let head = AppHeader::new(self.cfg.app_id, REPORT_LEN as u8);
        rpt.up = !self.root;
        let result = if self.root {
            self.stack.send_down(&head, &rpt.encode())
        } else {
            self.stack.send_up(&head, &rpt.encode())
        };
        if let Err(e) = result {
            logw!(TAG, "report broadcast failed: {}", e);
        }
    }

    fn comm_loop(&self) {
        logging::set_node_tag(self.stack.node_id());
        logi!(
            TAG,
            "communication task started{}",
            if self.root { " (root)" } else { "" }
        );

        while !self.shutdown.load(Ordering::Acquire) {
            match self.stack.receive(self.cfg.app_id, Some(self.cfg.receive_timeout)) {
                Ok(msg) => {
                    if msg.header.len as usize != REPORT_LEN {
                        continue;
                    }
                    let Some(rpt) = Report::decode(&msg.payload) else {
                        continue;
                    };

                    if !rpt.up || self.root {
                        // Flood the subtree first so it converges, then
                        // reconcile locally.
                        let mut down = rpt.clone();
                        down.up = false;
                        let head = AppHeader::new(self.cfg.app_id, REPORT_LEN as u8);
                        let _ = self.stack.send_down(&head, &down.encode());

                        let follow = {
                            let mut job = self.job.lock().unwrap();
                            job.process_report(&down)
                        };
                        if let Some(r) = follow {
                            self.broadcast(r);
                        }
                    } else {
                        // Climbing report at a non-root: pass it along.
                        let head = AppHeader::new(self.cfg.app_id, REPORT_LEN as u8);
                        let _ = self.stack.send_up(&head, &msg.payload);
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(NetError::Timeout) => continue,
                Err(_) => break,
            }
        }
        logi!(TAG, "communication task stopped");
    }

    fn compute_loop(&self) {
        logging::set_node_tag(self.stack.node_id());
        thread::sleep(self.cfg.startup_delay);
        logi!(TAG, "Computing!");

        while !self.shutdown.load(Ordering::Acquire) {
            let bi = {
                let job = self.job.lock().unwrap();
                job.pick_block(rand::random::<u32>())
            };
            if !self.compute_block(bi) {
                break;
            }
            thread::yield_now();
        }

        let frame = self.job.lock().unwrap().base;
        logi!(TAG, "Computation task terminated (frame {})", frame);
    }

    /// Claim and grind one block, then record it Done and gossip the
    /// progress. Returns false when the task should terminate.
    fn compute_block(&self, bi: usize) -> bool {
        let waterlevel = {
            let mut job = self.job.lock().unwrap();
            if job.overflow {
                loge!(TAG, "Overflow detected -- computation cancelled");
                return false;
            }
            job.block_id = bi as i16;
            match job.blocks[bi] {
                BlockState::Done => return true,
                BlockState::Taken => logw!(TAG, "Recomputing the same block?!"),
                BlockState::Free => job.blocks[bi] = BlockState::Taken,
            }
            logi!(TAG, "Computing block {} from frame {}", bi, job.base);
            let rpt = job.report(BlockState::Taken);
            let waterlevel = match job.waterlevel(bi) {
                Ok(w) => w,
                Err(_) => {
                    job.overflow = true;
                    loge!(TAG, "Overflow detected -- computation cancelled");
                    return false;
                }
            };
            drop(job);
            self.broadcast(rpt);
            waterlevel
        };

        // The long loop runs with the mutex released.
        match verify_block(waterlevel, self.cfg.block_size, &self.shutdown) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(Overflow) => {
                self.job.lock().unwrap().overflow = true;
                loge!(TAG, "Overflow detected -- computation terminated");
                return false;
            }
        }

        let follow = {
            let mut job = self.job.lock().unwrap();
            if job.block_id < 0 {
                // A peer finished this block while we were computing.
                None
            } else {
                let id = job.block_id as usize;
                job.blocks[id] = BlockState::Done;
                let follow = job.report_my_progress(true);
                job.block_id = -1;
                follow
            }
        };
        if let Some(r) = follow {
            self.broadcast(r);
        }
        true
    }
}
