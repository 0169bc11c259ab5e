//! Synchronous convenience wrapper: a private poll loop, one context and
//! one stream behind a read/write/drain interface, for tools that just
//! want to move audio without owning an event loop.

use std::{cell::Cell, rc::Rc};

use chorus_loop::Mainloop;
use chorus_timing::MicroSeconds;
use chorus_wire::{ChannelVolumes, ErrorCode, SampleSpec, VOLUME_NORM};

use crate::{
    Context, Stream,
    types::{BufferAttr, ContextState, Direction, StreamFlags, StreamState},
};

/// A connected, ready stream with blocking semantics.
pub struct BlockingStream {
    ml: Mainloop,
    context: Context,
    stream: Stream,
    direction: Direction,
}

impl BlockingStream {
    pub fn open_playback(
        server: Option<&str>,
        app_name: &str,
        stream_name: &str,
        spec: &SampleSpec,
        attr: Option<&BufferAttr>,
    ) -> Result<Self, ErrorCode> {
        Self::open(Direction::Playback, server, app_name, stream_name, spec, attr)
    }

    pub fn open_record(
        server: Option<&str>,
        app_name: &str,
        stream_name: &str,
        spec: &SampleSpec,
        attr: Option<&BufferAttr>,
    ) -> Result<Self, ErrorCode> {
        Self::open(Direction::Record, server, app_name, stream_name, spec, attr)
    }

    fn open(
        direction: Direction,
        server: Option<&str>,
        app_name: &str,
        stream_name: &str,
        spec: &SampleSpec,
        attr: Option<&BufferAttr>,
    ) -> Result<Self, ErrorCode> {
        let ml = Mainloop::new();
        let context = Context::new(&ml.api(), app_name);
        context.connect(server, None)?;

        while context.state() != ContextState::Ready {
            if context.state().is_terminal() {
                return Err(nonzero_error(context.last_error()));
            }
            iterate(&ml)?;
        }

        let stream = Stream::new(&context, stream_name, spec, None)?;
        match direction {
            Direction::Playback => stream.connect_playback(
                None,
                attr,
                StreamFlags::empty(),
                ChannelVolumes::uniform(spec.channels, VOLUME_NORM),
            )?,
            Direction::Record => stream.connect_record(None, attr, StreamFlags::empty())?,
            Direction::Upload => return Err(ErrorCode::Invalid),
        }

        let this = Self { ml, context, stream, direction };
        while this.stream.state() != StreamState::Ready {
            if this.stream.state().is_terminal() {
                return Err(nonzero_error(this.context.last_error()));
            }
            this.step()?;
        }
        Ok(this)
    }

    fn step(&self) -> Result<(), ErrorCode> {
        if self.context.state().is_terminal() || self.stream.state().is_terminal() {
            return Err(nonzero_error(self.context.last_error()));
        }
        iterate(&self.ml)
    }

    /// Writes all of `data`, waiting for server credit as needed.
    pub fn write(&self, mut data: &[u8]) -> Result<(), ErrorCode> {
        if self.direction != Direction::Playback {
            return Err(ErrorCode::Invalid);
        }
        while !data.is_empty() {
            let credit = self.stream.writable_size();
            if credit == 0 {
                self.step()?;
                continue;
            }
            let n = credit.min(data.len());
            self.stream.write(&data[..n], 0)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Fills all of `buf` with recorded audio.
    pub fn read(&self, buf: &mut [u8]) -> Result<(), ErrorCode> {
        if self.direction != Direction::Record {
            return Err(ErrorCode::Invalid);
        }
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.peek() {
                Some(chunk) => {
                    let n = chunk.length.min(buf.len() - filled);
                    buf[filled..filled + n].copy_from_slice(&chunk.as_slice()[..n]);
                    self.stream.discard(n);
                    filled += n;
                }
                None => self.step()?,
            }
        }
        Ok(())
    }

    /// Blocks until the server has played everything written so far.
    pub fn drain(&self) -> Result<(), ErrorCode> {
        let done = Rc::new(Cell::new(None));
        let d = Rc::clone(&done);
        let _op = self.stream.drain(Some(Box::new(move |success| d.set(Some(success)))))?;

        while done.get().is_none() {
            self.step()?;
        }
        if done.get() == Some(true) {
            Ok(())
        } else {
            Err(nonzero_error(self.context.last_error()))
        }
    }

    /// Blocks for one latency measurement and returns the total latency.
    pub fn get_latency(&self) -> Result<MicroSeconds, ErrorCode> {
        let result = Rc::new(Cell::new(None));
        let r = Rc::clone(&result);
        let stream = self.stream.clone();
        let _op = self.stream.get_latency_info(Some(Box::new(move |info| {
            r.set(Some(info.map(|i| stream.get_latency(i).0)));
        })))?;

        while result.get().is_none() {
            self.step()?;
        }
        result.get().unwrap().ok_or_else(|| nonzero_error(self.context.last_error()))
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Drop for BlockingStream {
    fn drop(&mut self) {
        let _ = self.stream.disconnect();
        self.context.disconnect();
        // Give the teardown packets a chance to flush.
        for _ in 0..16 {
            if self.ml.iterate(false).is_err() {
                break;
            }
        }
    }
}

fn iterate(ml: &Mainloop) -> Result<(), ErrorCode> {
    match ml.iterate(true) {
        Ok(_) => Ok(()),
        Err(_) => Err(ErrorCode::Internal),
    }
}

fn nonzero_error(e: ErrorCode) -> ErrorCode {
    if e == ErrorCode::Ok { ErrorCode::Internal } else { e }
}
