#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use launchdrop_core::backend::memory::MemoryBuilder;
use launchdrop_core::{
    BufferMeta, Config, EventDispatcher, GraphBuilder, LifecycleDriver, StopReason, TapConfig,
    TapStats,
};

#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn config(target: Option<&str>, allow: u64, drop: u64, sync: bool) -> Config {
    Config {
        tap: TapConfig {
            target: target.map(str::to_string),
            allow_count: allow,
            drop_count: drop,
            request_sync_point: sync,
        },
        ..Config::default()
    }
}

pub fn silent_dispatcher() -> EventDispatcher {
    EventDispatcher::new(false, Box::new(io::sink()), Box::new(io::sink()))
}

/// Everything observable after a memory graph run
pub struct RunResult {
    pub reason: StopReason,
    pub received: Vec<BufferMeta>,
    pub stats: Option<TapStats>,
    /// Requests seen by the encoder named `encoder`
    pub key_unit_requests: Option<u64>,
    pub stdout: String,
    pub stderr: String,
}

pub fn run_memory(description: &str, config: Config) -> RunResult {
    let graph = MemoryBuilder::new()
        .build(&[description.to_string()])
        .expect("description should build");
    let probe = graph.probe();

    let out = SharedBuffer::default();
    let err = SharedBuffer::default();
    let dispatcher = EventDispatcher::new(
        config.output.verbose,
        Box::new(out.clone()),
        Box::new(err.clone()),
    );

    let mut driver = LifecycleDriver::new(graph, &config, dispatcher);
    driver.start().expect("graph should start");
    let reason = driver.run_until_terminal().expect("run should complete");
    let stats = driver.tap_stats();
    drop(driver);

    RunResult {
        reason,
        received: probe.received(),
        stats,
        key_unit_requests: probe.key_unit_requests("encoder"),
        stdout: out.contents(),
        stderr: err.contents(),
    }
}
