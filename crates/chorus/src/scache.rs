//! Sample-cache operations: trigger or remove samples previously uploaded
//! through an upload stream.

use chorus_wire::{Command, ErrorCode, Volume};

use crate::{Context, Operation, context::AckCb, types::INVALID_INDEX};

impl Context {
    /// Plays the named cached sample on `dev` (or the default sink).
    pub fn play_sample(
        &self,
        name: &str,
        dev: Option<&str>,
        volume: Volume,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        let dev = dev.map(str::to_owned).or_else(|| self.inner.conf.default_sink.clone());
        self.ack_request(Command::PlaySample, |w| {
            w.put_u32(INVALID_INDEX);
            w.put_string(dev.as_deref());
            w.put_u32(volume);
            w.put_string(Some(name));
        }, cb)
    }

    /// Evicts the named sample from the cache.
    pub fn remove_sample(&self, name: &str, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        self.ack_request(Command::RemoveSample, |w| w.put_string(Some(name)), cb)
    }
}
