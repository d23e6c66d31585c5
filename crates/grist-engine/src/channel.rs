//! Command channel
//!
//! The host embeds a [`Channel`] and feeds it line-delimited commands:
//! `init <key=value ...>` configures the options, `attach` brings a
//! context up, `detach` tears it down. `attach` after `attach` (and
//! `detach` after `detach`) are no-ops. Reading the channel drains the
//! accumulated log.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::InitReason;
use crate::context::{Context, Options};

/// The line-command endpoint.
pub struct Channel {
    options: Mutex<Options>,
    context: Mutex<Option<Arc<Context>>>,
    log: Mutex<String>,
}

impl Channel {
    pub fn new() -> Channel {
        Channel {
            options: Mutex::new(Options::default()),
            context: Mutex::new(None),
            log: Mutex::new(String::new()),
        }
    }

    /// The attached context, if any.
    pub fn context(&self) -> Option<Arc<Context>> {
        self.context.lock().clone()
    }

    /// Process one command line.
    pub fn write_line(&self, line: &str) {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("init") => self.handle_init(words),
            Some("attach") => self.handle_attach(),
            Some("detach") => self.handle_detach(),
            Some(other) => self.log_line(&format!("unknown command: {other}")),
            None => {}
        }
    }

    /// Drain the accumulated log (channel lines plus context lines).
    pub fn read(&self) -> String {
        let mut out = std::mem::take(&mut *self.log.lock());
        if let Some(ctx) = self.context() {
            out.push_str(&ctx.drain_log());
        }
        out
    }

    fn handle_init<'a>(&self, words: impl Iterator<Item = &'a str>) {
        if self.context.lock().is_some() {
            self.log_line("init ignored: already attached");
            return;
        }
        let mut options = self.options.lock();
        for word in words {
            let Some((key, value)) = word.split_once('=') else {
                self.log_line(&format!("init: malformed option {word:?}"));
                continue;
            };
            let parsed: Result<u64, _> = value.parse();
            let Ok(value) = parsed else {
                self.log_line(&format!("init: non-numeric value for {key}"));
                continue;
            };
            match key {
                "cache_slab_pages" => options.cache_slab_pages = value as usize,
                "edge_slab_pages" => options.edge_slab_pages = value as usize,
                "patch_threshold" => options.patch_threshold = value as u32,
                "indirect_buckets" => options.indirect_buckets = (value as usize).next_power_of_two(),
                "slot_count" => options.slot_count = value as u16,
                "max_trace_blocks" => options.max_trace_blocks = value as usize,
                "max_instrument_rounds" => options.max_instrument_rounds = value as u32,
                other => self.log_line(&format!("init: unknown option {other}")),
            }
        }
    }

    fn handle_attach(&self) {
        let mut context = self.context.lock();
        if context.is_some() {
            // Idempotent.
            return;
        }
        let ctx = Context::new(*self.options.lock());
        if let Err(error) = ctx.init_clients(InitReason::Attach) {
            self.log_line(&format!("attach: client init failed: {error}"));
        }
        self.log_line("attached");
        *context = Some(ctx);
    }

    fn handle_detach(&self) {
        let mut context = self.context.lock();
        let Some(ctx) = context.take() else {
            // Idempotent.
            return;
        };
        ctx.exit_clients(InitReason::Detach);
        self.log_line("detached");
    }

    fn log_line(&self, line: &str) {
        let mut log = self.log.lock();
        log.push_str(line);
        log.push('\n');
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_parses_options() {
        let channel = Channel::new();
        channel.write_line("init patch_threshold=4 slot_count=16 indirect_buckets=100");
        let options = *channel.options.lock();
        assert_eq!(options.patch_threshold, 4);
        assert_eq!(options.slot_count, 16);
        // Bucket counts are rounded up to a power of two.
        assert_eq!(options.indirect_buckets, 128);
    }

    #[test]
    fn test_attach_is_idempotent() {
        let channel = Channel::new();
        channel.write_line("attach");
        let first = channel.context().unwrap();
        channel.write_line("attach");
        let second = channel.context().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_detach_is_idempotent() {
        let channel = Channel::new();
        channel.write_line("attach");
        channel.write_line("detach");
        assert!(channel.context().is_none());
        channel.write_line("detach");
        assert!(channel.context().is_none());
    }

    #[test]
    fn test_read_drains_log() {
        let channel = Channel::new();
        channel.write_line("frobnicate");
        let log = channel.read();
        assert!(log.contains("unknown command"));
        assert!(channel.read().is_empty());
    }

    #[test]
    fn test_init_after_attach_ignored() {
        let channel = Channel::new();
        channel.write_line("attach");
        channel.write_line("init patch_threshold=99");
        assert_eq!(channel.options.lock().patch_threshold, Options::default().patch_threshold);
        assert!(channel.read().contains("init ignored"));
    }
}
