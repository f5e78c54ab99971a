// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:

//! Streams the exceptions thrown in a .NET process.
//!
//! The target is either launched by us, in which case its runtime connects
//! back to a [`diagnostics_ipc::Server`] and is held suspended until the
//! trace session is running, or it is an already running process that we
//! attach to through its own diagnostics socket. Either way every
//! `ExceptionThrown_V1` event in the session's stream is handed to an
//! [`ExceptionHandler`], in the order the runtime emitted them.

pub mod interrupt;
mod launch;

pub use interrupt::Interrupt;
pub use launch::{DIAGNOSTIC_PORTS_VAR, Launched, launch};
pub use nettrace::ExceptionEvent;

use anyhow::Context as _;
use diagnostics_ipc::{Client, ControlPath, SessionConfig, TraceSession};
use nettrace::{StreamParser, StreamRecord};
use std::{ffi::OsString, io::Write, time::Duration};

/// What to trace
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// A running process
    Attach(u32),
    /// A program we spawn
    Launch {
        program: OsString,
        args: Vec<OsString>,
    },
}

impl Target {
    /// A lone process id attaches to that process, anything else is a program
    /// and its arguments
    pub fn parse(args: Vec<OsString>) -> anyhow::Result<Self> {
        let mut args = args.into_iter();
        let Some(first) = args.next() else {
            anyhow::bail!("a process id or a program to launch is required");
        };

        if let Some(pid) = first.to_str().and_then(|s| s.parse::<u32>().ok()) {
            let rest: Vec<_> = args.collect();
            anyhow::ensure!(
                rest.is_empty(),
                "unexpected arguments after process id {pid}: {rest:?}"
            );
            return Ok(Self::Attach(pid));
        }

        Ok(Self::Launch {
            program: first,
            args: args.collect(),
        })
    }
}

/// Whether the stream should keep being read
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Exit,
}

/// How a stream of exceptions ended
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The runtime ended the stream, usually because the process exited
    Completed,
    /// We stopped the session, via an interrupt or [`LoopAction::Exit`]
    Stopped,
}

pub trait ExceptionHandler {
    /// Called for each exception, in the order they were thrown
    fn on_exception(&mut self, exception: &ExceptionEvent) -> LoopAction;
}

/// Prints every exception on its own line
pub struct ConsoleSink<W> {
    out: W,
}

impl ConsoleSink<std::io::Stdout> {
    #[inline]
    pub fn stdout() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl<W: Write> ConsoleSink<W> {
    #[inline]
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[inline]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ExceptionHandler for ConsoleSink<W> {
    fn on_exception(&mut self, exception: &ExceptionEvent) -> LoopAction {
        let res = writeln!(
            self.out,
            "Exception event: [{}] '{}'",
            exception.type_name, exception.message
        )
        .and_then(|()| self.out.flush());

        match res {
            Ok(()) => LoopAction::Continue,
            Err(err) => {
                log::warn!("unable to write exception, stopping: {err}");
                LoopAction::Exit
            }
        }
    }
}

/// Settings shared by both kinds of [`Target`]
#[derive(Clone, Debug)]
pub struct Options {
    pub session: SessionConfig,
    /// How long a launched runtime has to connect back to us
    pub connect_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            session: SessionConfig::exceptions(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Starts a session with a runtime that is already running
pub fn attach(client: Client, config: &SessionConfig) -> anyhow::Result<TraceSession> {
    let pid = client.endpoint().pid;
    let transport = client
        .connect()
        .with_context(|| format!("failed to connect to process {pid}"))?;

    TraceSession::start(transport, config, ControlPath::Connect(client))
        .with_context(|| format!("failed to start a trace session in process {pid}"))
}

/// Reads the session's stream until it ends, handing every exception to
/// `handler`.
///
/// Events that can't be decoded as exceptions are skipped. Anything wrong with
/// the stream itself, including unknown or redefined metadata ids, ends the run.
pub fn stream_exceptions(
    session: &mut TraceSession,
    handler: &mut dyn ExceptionHandler,
) -> Result<Outcome, nettrace::Error> {
    let mut parser = StreamParser::new();
    let stopped = |session: &TraceSession| {
        if session.is_stopped() {
            Outcome::Stopped
        } else {
            Outcome::Completed
        }
    };

    loop {
        let record = match parser.next_record(&mut *session) {
            Ok(record) => record,
            Err(_) if session.is_stopped() => return Ok(Outcome::Stopped),
            Err(err) => return Err(err),
        };

        match record {
            StreamRecord::Header(header) => {
                log::debug!(
                    "trace of process {} started, pointer size {}",
                    header.process_id,
                    header.pointer_size
                );
            }
            StreamRecord::MetadataDefinition(def) => {
                log::trace!(
                    "metadata {}: {}/{} v{}",
                    def.metadata_id,
                    def.provider_name,
                    def.event_id,
                    def.version
                );
            }
            StreamRecord::EventData(event) => {
                let Some(def) = parser.metadata(event.metadata_id) else {
                    continue;
                };

                let Some(exception) = nettrace::try_decode(def, &event) else {
                    continue;
                };

                if handler.on_exception(&exception) == LoopAction::Exit {
                    session.stop();
                    return Ok(Outcome::Stopped);
                }
            }
            StreamRecord::EndOfStream => {
                log::debug!("trace stream ended after {} bytes", parser.offset());
                return Ok(stopped(session));
            }
        }
    }
}

/// Traces `target` until its stream ends or the session is stopped
pub fn run(
    target: Target,
    options: &Options,
    interrupt: &Interrupt,
    handler: &mut dyn ExceptionHandler,
) -> anyhow::Result<Outcome> {
    match target {
        Target::Attach(pid) => {
            let client = Client::for_pid(pid)
                .with_context(|| format!("unable to attach to process {pid}"))?;
            let mut session = attach(client, &options.session)?;
            interrupt.register(session.stop_handle());

            stream_exceptions(&mut session, handler).context("failed to read the trace stream")
        }
        Target::Launch { program, args } => {
            let mut launched = match launch(
                &program,
                &args,
                &options.session,
                options.connect_timeout,
                interrupt.flag(),
            ) {
                Ok(launched) => launched,
                // Stopping before the runtime was resumed is still a stop
                Err(err) if launch::is_cancelled(&err) => return Ok(Outcome::Stopped),
                Err(err) => return Err(err),
            };
            interrupt.register(launched.session.stop_handle());

            let outcome = stream_exceptions(&mut launched.session, handler)
                .context("failed to read the trace stream");
            let child = &mut launched.child;

            match outcome {
                Ok(Outcome::Completed) => {
                    let status = child
                        .wait()
                        .context("failed to wait for the launched process")?;
                    log::info!("process {} exited with {status}", child.id());
                }
                _ => match child.try_wait() {
                    Ok(Some(status)) => log::info!("process {} exited with {status}", child.id()),
                    Ok(None) => log::info!("process {} is still running", child.id()),
                    Err(err) => log::warn!("failed to query process {}: {err}", child.id()),
                },
            }

            outcome
        }
    }
}
