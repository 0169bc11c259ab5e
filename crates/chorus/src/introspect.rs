//! Typed request/reply wrappers for the server enumeration and management
//! commands.
//!
//! Enumerations are streamed: one reply carries all tuples back to back,
//! and the wrapper invokes the callback once per tuple followed by a final
//! [`ListResult::End`]. Single-item lookups invoke their callback exactly
//! once, with `None` on failure.

use std::rc::Rc;

use chorus_net::ReplyCallback;
use chorus_timing::MicroSeconds;
use chorus_wire::{
    Command, ErrorCode, SampleSpec, TagstructError, TagstructReader, TagstructWriter, Volume,
};
use strum::FromRepr;

use crate::{
    Context, Operation,
    context::AckCb,
    operation::OperationInner,
    types::{INVALID_INDEX, ListResult},
};

pub type SingleInfoCb<T> = Box<dyn FnOnce(Option<&T>)>;
pub type ListInfoCb<T> = Box<dyn FnMut(ListResult<'_, T>)>;
pub type IndexCb = Box<dyn FnOnce(u32)>;

type ParseFn<T> = fn(&mut TagstructReader<'_>) -> Result<T, TagstructError>;

/// Daemon memory statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatInfo {
    pub memblock_total: u32,
    pub memblock_total_size: u32,
    pub memblock_allocated: u32,
    pub memblock_allocated_size: u32,
    pub scache_size: u32,
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub user_name: Option<String>,
    pub host_name: Option<String>,
    pub sample_spec: SampleSpec,
    pub default_sink_name: Option<String>,
    pub default_source_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SinkInfo {
    pub index: u32,
    pub name: String,
    pub description: Option<String>,
    pub sample_spec: SampleSpec,
    pub owner_module: u32,
    pub volume: Volume,
    pub monitor_source: u32,
    pub monitor_source_name: Option<String>,
    pub latency: MicroSeconds,
}

#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub index: u32,
    pub name: String,
    pub description: Option<String>,
    pub sample_spec: SampleSpec,
    pub owner_module: u32,
    pub monitor_of_sink: u32,
    pub monitor_of_sink_name: Option<String>,
    pub latency: MicroSeconds,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub index: u32,
    pub name: String,
    pub protocol_name: Option<String>,
    pub owner_module: u32,
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub index: u32,
    pub name: String,
    pub argument: Option<String>,
    pub n_used: u32,
    pub auto_unload: bool,
}

#[derive(Debug, Clone)]
pub struct SinkInputInfo {
    pub index: u32,
    pub name: String,
    pub owner_module: u32,
    pub client: u32,
    pub sink: u32,
    pub sample_spec: SampleSpec,
    pub volume: Volume,
    pub buffer_usec: MicroSeconds,
    pub sink_usec: MicroSeconds,
}

#[derive(Debug, Clone)]
pub struct SourceOutputInfo {
    pub index: u32,
    pub name: String,
    pub owner_module: u32,
    pub client: u32,
    pub source: u32,
    pub sample_spec: SampleSpec,
    pub buffer_usec: MicroSeconds,
    pub source_usec: MicroSeconds,
}

#[derive(Debug, Clone)]
pub struct SampleInfo {
    pub index: u32,
    pub name: String,
    pub volume: Volume,
    pub duration: MicroSeconds,
    pub sample_spec: SampleSpec,
    pub bytes: u32,
    pub lazy: bool,
    pub filename: Option<String>,
}

/// Whether an autoload entry names a sink or a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum AutoloadType {
    Sink = 0,
    Source = 1,
}

#[derive(Debug, Clone)]
pub struct AutoloadInfo {
    pub index: u32,
    pub name: String,
    pub kind: AutoloadType,
    pub module: String,
    pub argument: Option<String>,
}

fn req_string(ts: &mut TagstructReader<'_>) -> Result<String, TagstructError> {
    ts.get_string()?
        .map(str::to_owned)
        .ok_or(TagstructError::Invalid("unexpected null string"))
}

fn opt_string(ts: &mut TagstructReader<'_>) -> Result<Option<String>, TagstructError> {
    Ok(ts.get_string()?.map(str::to_owned))
}

fn parse_stat(ts: &mut TagstructReader<'_>) -> Result<StatInfo, TagstructError> {
    Ok(StatInfo {
        memblock_total: ts.get_u32()?,
        memblock_total_size: ts.get_u32()?,
        memblock_allocated: ts.get_u32()?,
        memblock_allocated_size: ts.get_u32()?,
        scache_size: ts.get_u32()?,
    })
}

fn parse_server_info(ts: &mut TagstructReader<'_>) -> Result<ServerInfo, TagstructError> {
    Ok(ServerInfo {
        server_name: opt_string(ts)?,
        server_version: opt_string(ts)?,
        user_name: opt_string(ts)?,
        host_name: opt_string(ts)?,
        sample_spec: ts.get_sample_spec()?,
        default_sink_name: opt_string(ts)?,
        default_source_name: opt_string(ts)?,
    })
}

fn parse_sink_info(ts: &mut TagstructReader<'_>) -> Result<SinkInfo, TagstructError> {
    Ok(SinkInfo {
        index: ts.get_u32()?,
        name: req_string(ts)?,
        description: opt_string(ts)?,
        sample_spec: ts.get_sample_spec()?,
        owner_module: ts.get_u32()?,
        volume: ts.get_u32()?,
        monitor_source: ts.get_u32()?,
        monitor_source_name: opt_string(ts)?,
        latency: ts.get_usec()?,
    })
}

fn parse_source_info(ts: &mut TagstructReader<'_>) -> Result<SourceInfo, TagstructError> {
    Ok(SourceInfo {
        index: ts.get_u32()?,
        name: req_string(ts)?,
        description: opt_string(ts)?,
        sample_spec: ts.get_sample_spec()?,
        owner_module: ts.get_u32()?,
        monitor_of_sink: ts.get_u32()?,
        monitor_of_sink_name: opt_string(ts)?,
        latency: ts.get_usec()?,
    })
}

fn parse_client_info(ts: &mut TagstructReader<'_>) -> Result<ClientInfo, TagstructError> {
    Ok(ClientInfo {
        index: ts.get_u32()?,
        name: req_string(ts)?,
        protocol_name: opt_string(ts)?,
        owner_module: ts.get_u32()?,
    })
}

fn parse_module_info(ts: &mut TagstructReader<'_>) -> Result<ModuleInfo, TagstructError> {
    Ok(ModuleInfo {
        index: ts.get_u32()?,
        name: req_string(ts)?,
        argument: opt_string(ts)?,
        n_used: ts.get_u32()?,
        auto_unload: ts.get_boolean()?,
    })
}

fn parse_sink_input_info(ts: &mut TagstructReader<'_>) -> Result<SinkInputInfo, TagstructError> {
    Ok(SinkInputInfo {
        index: ts.get_u32()?,
        name: req_string(ts)?,
        owner_module: ts.get_u32()?,
        client: ts.get_u32()?,
        sink: ts.get_u32()?,
        sample_spec: ts.get_sample_spec()?,
        volume: ts.get_u32()?,
        buffer_usec: ts.get_usec()?,
        sink_usec: ts.get_usec()?,
    })
}

fn parse_source_output_info(
    ts: &mut TagstructReader<'_>,
) -> Result<SourceOutputInfo, TagstructError> {
    Ok(SourceOutputInfo {
        index: ts.get_u32()?,
        name: req_string(ts)?,
        owner_module: ts.get_u32()?,
        client: ts.get_u32()?,
        source: ts.get_u32()?,
        sample_spec: ts.get_sample_spec()?,
        buffer_usec: ts.get_usec()?,
        source_usec: ts.get_usec()?,
    })
}

fn parse_sample_info(ts: &mut TagstructReader<'_>) -> Result<SampleInfo, TagstructError> {
    Ok(SampleInfo {
        index: ts.get_u32()?,
        name: req_string(ts)?,
        volume: ts.get_u32()?,
        duration: ts.get_usec()?,
        sample_spec: ts.get_sample_spec()?,
        bytes: ts.get_u32()?,
        lazy: ts.get_boolean()?,
        filename: opt_string(ts)?,
    })
}

fn parse_autoload_info(ts: &mut TagstructReader<'_>) -> Result<AutoloadInfo, TagstructError> {
    Ok(AutoloadInfo {
        index: ts.get_u32()?,
        name: req_string(ts)?,
        kind: AutoloadType::from_repr(ts.get_u32()?)
            .ok_or(TagstructError::Invalid("unknown autoload type"))?,
        module: req_string(ts)?,
        argument: opt_string(ts)?,
    })
}

impl Context {
    fn single_request<T: 'static>(
        &self,
        command: Command,
        fields: impl FnOnce(&mut TagstructWriter),
        parse: ParseFn<T>,
        cb: SingleInfoCb<T>,
    ) -> Result<Operation, ErrorCode> {
        let ctx = &self.inner;
        ctx.ensure_ready()?;
        let op = OperationInner::start(ctx);

        let weak = Rc::downgrade(ctx);
        let opc = Rc::clone(&op);
        let reply: ReplyCallback = Box::new(move |command, _tag, ts| {
                let Some(ctx) = weak.upgrade() else { return };
                let _guard = Rc::clone(&ctx);

                let item = match command {
                    Command::Reply => {
                        match ts
                            .ok_or(TagstructError::ShortBuffer)
                            .and_then(|ts| {
                                let item = parse(&mut *ts)?;
                                ts.expect_eof()?;
                                Ok(item)
                            })
                        {
                            Ok(item) => Some(item),
                            Err(_) => {
                                ctx.fail(ErrorCode::Protocol);
                                None
                            }
                        }
                    }
                    _ => {
                        let _ = ctx.handle_reply_error(command, ts);
                        None
                    }
                };

                if opc.is_running() {
                    cb(item.as_ref());
                }
                opc.done();
            },
        );

        ctx.request(command, ctx.reply_timeout(), ctx.owner_token(), fields, reply)?;
        Ok(Operation::new(op))
    }

    fn list_request<T: 'static>(
        &self,
        command: Command,
        mut cb: ListInfoCb<T>,
        parse: ParseFn<T>,
    ) -> Result<Operation, ErrorCode> {
        let ctx = &self.inner;
        ctx.ensure_ready()?;
        let op = OperationInner::start(ctx);

        let weak = Rc::downgrade(ctx);
        let opc = Rc::clone(&op);
        let reply: ReplyCallback = Box::new(move |command, _tag, ts| {
                let Some(ctx) = weak.upgrade() else { return };
                let _guard = Rc::clone(&ctx);

                if command != Command::Reply {
                    let failed = ctx.handle_reply_error(command, ts).is_err();
                    if !failed && opc.is_running() {
                        cb(ListResult::Error);
                    }
                    opc.done();
                    return;
                }

                let Some(ts) = ts else {
                    ctx.fail(ErrorCode::Protocol);
                    opc.done();
                    return;
                };
                while !ts.eof() {
                    match parse(&mut *ts) {
                        Ok(item) => {
                            if opc.is_running() {
                                cb(ListResult::Item(&item));
                            }
                        }
                        Err(_) => {
                            ctx.fail(ErrorCode::Protocol);
                            opc.done();
                            return;
                        }
                    }
                }
                if opc.is_running() {
                    cb(ListResult::End);
                }
                opc.done();
            },
        );

        ctx.request(command, ctx.reply_timeout(), ctx.owner_token(), |_| {}, reply)?;
        Ok(Operation::new(op))
    }

    /// Daemon memory statistics.
    pub fn stat(&self, cb: SingleInfoCb<StatInfo>) -> Result<Operation, ErrorCode> {
        self.single_request(Command::Stat, |_| {}, parse_stat, cb)
    }

    pub fn get_server_info(&self, cb: SingleInfoCb<ServerInfo>) -> Result<Operation, ErrorCode> {
        self.single_request(Command::GetServerInfo, |_| {}, parse_server_info, cb)
    }

    pub fn get_sink_info_by_index(
        &self,
        index: u32,
        cb: SingleInfoCb<SinkInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(
            Command::GetSinkInfo,
            |w| {
                w.put_u32(index);
                w.put_string(None);
            },
            parse_sink_info,
            cb,
        )
    }

    pub fn get_sink_info_by_name(
        &self,
        name: &str,
        cb: SingleInfoCb<SinkInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(
            Command::GetSinkInfo,
            |w| {
                w.put_u32(INVALID_INDEX);
                w.put_string(Some(name));
            },
            parse_sink_info,
            cb,
        )
    }

    pub fn get_sink_info_list(&self, cb: ListInfoCb<SinkInfo>) -> Result<Operation, ErrorCode> {
        self.list_request(Command::GetSinkInfoList, cb, parse_sink_info)
    }

    pub fn get_source_info_by_index(
        &self,
        index: u32,
        cb: SingleInfoCb<SourceInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(
            Command::GetSourceInfo,
            |w| {
                w.put_u32(index);
                w.put_string(None);
            },
            parse_source_info,
            cb,
        )
    }

    pub fn get_source_info_by_name(
        &self,
        name: &str,
        cb: SingleInfoCb<SourceInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(
            Command::GetSourceInfo,
            |w| {
                w.put_u32(INVALID_INDEX);
                w.put_string(Some(name));
            },
            parse_source_info,
            cb,
        )
    }

    pub fn get_source_info_list(
        &self,
        cb: ListInfoCb<SourceInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.list_request(Command::GetSourceInfoList, cb, parse_source_info)
    }

    pub fn get_client_info(
        &self,
        index: u32,
        cb: SingleInfoCb<ClientInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(Command::GetClientInfo, |w| w.put_u32(index), parse_client_info, cb)
    }

    pub fn get_client_info_list(
        &self,
        cb: ListInfoCb<ClientInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.list_request(Command::GetClientInfoList, cb, parse_client_info)
    }

    pub fn get_module_info(
        &self,
        index: u32,
        cb: SingleInfoCb<ModuleInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(Command::GetModuleInfo, |w| w.put_u32(index), parse_module_info, cb)
    }

    pub fn get_module_info_list(
        &self,
        cb: ListInfoCb<ModuleInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.list_request(Command::GetModuleInfoList, cb, parse_module_info)
    }

    pub fn get_sink_input_info(
        &self,
        index: u32,
        cb: SingleInfoCb<SinkInputInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(
            Command::GetSinkInputInfo,
            |w| w.put_u32(index),
            parse_sink_input_info,
            cb,
        )
    }

    pub fn get_sink_input_info_list(
        &self,
        cb: ListInfoCb<SinkInputInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.list_request(Command::GetSinkInputInfoList, cb, parse_sink_input_info)
    }

    pub fn get_source_output_info(
        &self,
        index: u32,
        cb: SingleInfoCb<SourceOutputInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(
            Command::GetSourceOutputInfo,
            |w| w.put_u32(index),
            parse_source_output_info,
            cb,
        )
    }

    pub fn get_source_output_info_list(
        &self,
        cb: ListInfoCb<SourceOutputInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.list_request(Command::GetSourceOutputInfoList, cb, parse_source_output_info)
    }

    pub fn get_sample_info_by_index(
        &self,
        index: u32,
        cb: SingleInfoCb<SampleInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(
            Command::GetSampleInfo,
            |w| {
                w.put_u32(index);
                w.put_string(None);
            },
            parse_sample_info,
            cb,
        )
    }

    pub fn get_sample_info_by_name(
        &self,
        name: &str,
        cb: SingleInfoCb<SampleInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(
            Command::GetSampleInfo,
            |w| {
                w.put_u32(INVALID_INDEX);
                w.put_string(Some(name));
            },
            parse_sample_info,
            cb,
        )
    }

    pub fn get_sample_info_list(
        &self,
        cb: ListInfoCb<SampleInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.list_request(Command::GetSampleInfoList, cb, parse_sample_info)
    }

    pub fn get_autoload_info_by_index(
        &self,
        index: u32,
        cb: SingleInfoCb<AutoloadInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(
            Command::GetAutoloadInfo,
            |w| w.put_u32(index),
            parse_autoload_info,
            cb,
        )
    }

    pub fn get_autoload_info_by_name(
        &self,
        name: &str,
        kind: AutoloadType,
        cb: SingleInfoCb<AutoloadInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.single_request(
            Command::GetAutoloadInfo,
            |w| {
                w.put_string(Some(name));
                w.put_u32(kind as u32);
            },
            parse_autoload_info,
            cb,
        )
    }

    pub fn get_autoload_info_list(
        &self,
        cb: ListInfoCb<AutoloadInfo>,
    ) -> Result<Operation, ErrorCode> {
        self.list_request(Command::GetAutoloadInfoList, cb, parse_autoload_info)
    }

    pub fn add_autoload(
        &self,
        name: &str,
        kind: AutoloadType,
        module: &str,
        argument: Option<&str>,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        self.ack_request(
            Command::AddAutoload,
            |w| {
                w.put_string(Some(name));
                w.put_u32(kind as u32);
                w.put_string(Some(module));
                w.put_string(argument);
            },
            cb,
        )
    }

    pub fn remove_autoload_by_name(
        &self,
        name: &str,
        kind: AutoloadType,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        self.ack_request(
            Command::RemoveAutoload,
            |w| {
                w.put_string(Some(name));
                w.put_u32(kind as u32);
            },
            cb,
        )
    }

    pub fn remove_autoload_by_index(
        &self,
        index: u32,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        self.ack_request(Command::RemoveAutoload, |w| w.put_u32(index), cb)
    }

    pub fn set_sink_volume_by_index(
        &self,
        index: u32,
        volume: Volume,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        self.ack_request(
            Command::SetSinkVolume,
            |w| {
                w.put_u32(index);
                w.put_string(None);
                w.put_u32(volume);
            },
            cb,
        )
    }

    pub fn set_sink_volume_by_name(
        &self,
        name: &str,
        volume: Volume,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        self.ack_request(
            Command::SetSinkVolume,
            |w| {
                w.put_u32(INVALID_INDEX);
                w.put_string(Some(name));
                w.put_u32(volume);
            },
            cb,
        )
    }

    pub fn set_source_volume_by_index(
        &self,
        index: u32,
        volume: Volume,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        self.ack_request(
            Command::SetSourceVolume,
            |w| {
                w.put_u32(index);
                w.put_string(None);
                w.put_u32(volume);
            },
            cb,
        )
    }

    pub fn set_source_volume_by_name(
        &self,
        name: &str,
        volume: Volume,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        self.ack_request(
            Command::SetSourceVolume,
            |w| {
                w.put_u32(INVALID_INDEX);
                w.put_string(Some(name));
                w.put_u32(volume);
            },
            cb,
        )
    }

    pub fn set_sink_input_volume(
        &self,
        index: u32,
        volume: Volume,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        self.ack_request(
            Command::SetSinkInputVolume,
            |w| {
                w.put_u32(index);
                w.put_u32(volume);
            },
            cb,
        )
    }

    /// Loads a module; `cb` receives the new module's index, or
    /// `INVALID_INDEX` on failure.
    pub fn load_module(
        &self,
        name: &str,
        argument: Option<&str>,
        cb: Option<IndexCb>,
    ) -> Result<Operation, ErrorCode> {
        let ctx = &self.inner;
        ctx.ensure_ready()?;
        let op = OperationInner::start(ctx);

        let weak = Rc::downgrade(ctx);
        let opc = Rc::clone(&op);
        let reply: ReplyCallback = Box::new(move |command, _tag, ts| {
                let Some(ctx) = weak.upgrade() else { return };
                let _guard = Rc::clone(&ctx);

                let index = match command {
                    Command::Reply => {
                        match ts
                            .ok_or(TagstructError::ShortBuffer)
                            .and_then(|ts| ts.get_u32().and_then(|i| ts.expect_eof().map(|()| i)))
                        {
                            Ok(i) => i,
                            Err(_) => {
                                ctx.fail(ErrorCode::Protocol);
                                INVALID_INDEX
                            }
                        }
                    }
                    _ => {
                        let _ = ctx.handle_reply_error(command, ts);
                        INVALID_INDEX
                    }
                };

                if opc.is_running() {
                    if let Some(cb) = cb {
                        cb(index);
                    }
                }
                opc.done();
            },
        );

        ctx.request(
            Command::LoadModule,
            ctx.reply_timeout(),
            ctx.owner_token(),
            |w| {
                w.put_string(Some(name));
                w.put_string(argument);
            },
            reply,
        )?;
        Ok(Operation::new(op))
    }

    pub fn unload_module(&self, index: u32, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        self.ack_request(Command::UnloadModule, |w| w.put_u32(index), cb)
    }

    pub fn kill_client(&self, index: u32, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        self.ack_request(Command::KillClient, |w| w.put_u32(index), cb)
    }

    pub fn kill_sink_input(&self, index: u32, cb: Option<AckCb>) -> Result<Operation, ErrorCode> {
        self.ack_request(Command::KillSinkInput, |w| w.put_u32(index), cb)
    }

    pub fn kill_source_output(
        &self,
        index: u32,
        cb: Option<AckCb>,
    ) -> Result<Operation, ErrorCode> {
        self.ack_request(Command::KillSourceOutput, |w| w.put_u32(index), cb)
    }
}
