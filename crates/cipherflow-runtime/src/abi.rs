// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # ABI Wrappers
//!
//! Fixed `extern "C"` entry points called by compiled program code. Every call takes an
//! opaque context handle plus pointer/length pairs of `u64` words and returns a
//! [`StatusCode`]. Buffer lengths are checked against the partition before anything is
//! forwarded to the runtime, and panics are caught at the boundary.
//!
//! The message of the last failure on the calling thread is available from
//! [`cipherflow_last_error`].

use cipherflow_keys::{Partition, PartitionId};
use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

use crate::backend::ExecutionMode;
use crate::context::{Context, ContextOptions};
use crate::error::RuntimeError;
use crate::graph::OpKind;
use crate::program::{load_program, Program, ProgramArtifact};
use crate::value::{Value, ValueId};

/// Bumped whenever an entry point signature or status code changes
pub const ABI_VERSION: u32 = 1;

/// `flags` bit for `cipherflow_context_create`: offload eligible nodes to accelerators
pub const CONTEXT_FLAG_ACCELERATOR: u32 = 1 << 0;
/// `flags` bit: run on the simulation backend
pub const CONTEXT_FLAG_SIMULATION: u32 = 1 << 1;
/// `flags` bit: deterministic dispatch order
pub const CONTEXT_FLAG_DETERMINISTIC: u32 = 1 << 2;

/// Result of every fallible entry point
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    InvalidPartition = 1,
    KeyGeneration = 2,
    BufferShapeMismatch = 3,
    NodeExecution = 4,
    Device = 5,
    GraphCancelled = 6,
    NullPointer = 7,
    InvalidHandle = 8,
    Panic = 9,
    InvalidArgument = 10,
}

impl From<&RuntimeError> for StatusCode {
    fn from(err: &RuntimeError) -> Self {
        match err.root_cause() {
            RuntimeError::InvalidPartition { .. } | RuntimeError::UnknownPartition(_) => {
                StatusCode::InvalidPartition
            }
            RuntimeError::KeyGeneration { .. } => StatusCode::KeyGeneration,
            RuntimeError::BufferShapeMismatch { .. } => StatusCode::BufferShapeMismatch,
            RuntimeError::NodeExecution { .. } | RuntimeError::Remote { .. } => {
                StatusCode::NodeExecution
            }
            RuntimeError::Device(_) => StatusCode::Device,
            RuntimeError::GraphCancelled { .. }
            | RuntimeError::Cancelled
            | RuntimeError::ContextShutDown => StatusCode::GraphCancelled,
            RuntimeError::ValueKind { .. }
            | RuntimeError::InvalidGraph(_)
            | RuntimeError::UnknownValue(_)
            | RuntimeError::MissingArgument(_)
            | RuntimeError::InvalidArtifact(_)
            | RuntimeError::Initialization(_) => StatusCode::InvalidArgument,
        }
    }
}

/// Opaque context handle
pub struct CipherflowContext {
    inner: Context,
}

/// Opaque loaded program handle
pub struct CipherflowProgram {
    inner: Program,
}

struct AbiError {
    status: StatusCode,
    message: String,
}

impl AbiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn null(what: &str) -> Self {
        Self::new(StatusCode::NullPointer, format!("{} is null", what))
    }
}

impl From<RuntimeError> for AbiError {
    fn from(err: RuntimeError) -> Self {
        Self::new(StatusCode::from(&err), err.to_string())
    }
}

type AbiResult<T> = std::result::Result<T, AbiError>;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(message: &str) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

/// Run an entry point body, mapping errors and panics to a status code
fn guard<F>(entry: &'static str, body: F) -> i32
where
    F: FnOnce() -> AbiResult<()>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(AbiError::new(StatusCode::Panic, format!("panic in {}: {}", entry, reason)))
    });
    match outcome {
        Ok(()) => StatusCode::Ok as i32,
        Err(err) => {
            error!(entry, status = ?err.status, "{}", err.message);
            set_last_error(&err.message);
            err.status as i32
        }
    }
}

/// Borrow a caller buffer; a null pointer is accepted only for an empty buffer
///
/// # Safety
/// `ptr` must be valid for reads of `len` words for the returned lifetime.
unsafe fn words<'a>(ptr: *const u64, len: usize, what: &str) -> AbiResult<&'a [u64]> {
    if ptr.is_null() {
        return if len == 0 {
            Ok(&[])
        } else {
            Err(AbiError::null(what))
        };
    }
    Ok(std::slice::from_raw_parts(ptr, len))
}

/// # Safety
/// `ptr` must be valid for writes of `len` words for the returned lifetime.
unsafe fn words_mut<'a>(ptr: *mut u64, len: usize, what: &str) -> AbiResult<&'a mut [u64]> {
    if ptr.is_null() {
        return if len == 0 {
            Ok(&mut [])
        } else {
            Err(AbiError::null(what))
        };
    }
    Ok(std::slice::from_raw_parts_mut(ptr, len))
}

/// # Safety
/// `ctx` must be null or a handle returned by `cipherflow_context_create`.
unsafe fn context<'a>(ctx: *const CipherflowContext) -> AbiResult<&'a Context> {
    ctx.as_ref()
        .map(|handle| &handle.inner)
        .ok_or_else(|| AbiError::new(StatusCode::InvalidHandle, "context handle is null"))
}

fn check_len(what: &str, expected: usize, actual: usize) -> AbiResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(RuntimeError::BufferShapeMismatch {
            what: what.to_string(),
            expected,
            actual,
        }
        .into())
    }
}

fn registered_partition(ctx: &Context, partition: u32) -> AbiResult<Arc<Partition>> {
    ctx.partition(PartitionId(partition))
        .ok_or_else(|| RuntimeError::UnknownPartition(PartitionId(partition).to_string()).into())
}

/// Validate ciphertext buffers, run one operation and write the result
fn run_lwe_op(
    ctx: &Context,
    partition: u32,
    op: OpKind,
    out: &mut [u64],
    inputs: &[&[u64]],
) -> AbiResult<()> {
    let registered = registered_partition(ctx, partition)?;
    let expected = registered.ciphertext_len();
    check_len("output ciphertext", expected, out.len())?;
    for (index, input) in inputs.iter().enumerate() {
        check_len(&format!("input ciphertext {}", index), expected, input.len())?;
    }
    if ctx.mode() == ExecutionMode::Simulation {
        return Err(AbiError::new(
            StatusCode::InvalidArgument,
            "ciphertext operations are unavailable in simulation mode",
        ));
    }

    let values = inputs
        .iter()
        .map(|input| Value::Ciphertext(input.to_vec()))
        .collect();
    let result = ctx.run_op(op, PartitionId(partition), values)?;
    let ciphertext = result.as_ciphertext().ok_or_else(|| {
        AbiError::new(StatusCode::NodeExecution, "operation did not produce a ciphertext")
    })?;
    check_len("result ciphertext", out.len(), ciphertext.len())?;
    out.copy_from_slice(ciphertext);
    Ok(())
}

/// Version of this entry point set
#[no_mangle]
pub extern "C" fn cipherflow_abi_version() -> u32 {
    ABI_VERSION
}

/// Message of the last failed call on this thread, or null
///
/// The string stays valid until the next failing call on the same thread.
#[no_mangle]
pub extern "C" fn cipherflow_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |message| message.as_ptr())
    })
}

#[no_mangle]
/// # Safety
/// `out` must be valid for writing one pointer. The returned handle must be released
/// with `cipherflow_context_destroy`.
pub unsafe extern "C" fn cipherflow_context_create(
    parallelism: usize,
    flags: u32,
    key_cache_capacity: usize,
    out: *mut *mut CipherflowContext,
) -> i32 {
    guard("cipherflow_context_create", || {
        if out.is_null() {
            return Err(AbiError::null("out"));
        }
        let options = ContextOptions {
            parallelism,
            enable_accelerator: flags & CONTEXT_FLAG_ACCELERATOR != 0,
            enable_simulation: flags & CONTEXT_FLAG_SIMULATION != 0,
            deterministic_order: flags & CONTEXT_FLAG_DETERMINISTIC != 0,
            key_cache_capacity,
            ..ContextOptions::default()
        };
        let inner = Context::create(options)?;
        *out = Box::into_raw(Box::new(CipherflowContext { inner }));
        Ok(())
    })
}

#[no_mangle]
/// # Safety
/// `ctx` must be null or a handle from `cipherflow_context_create` that has not been
/// destroyed. No other call may use the handle concurrently or afterwards.
pub unsafe extern "C" fn cipherflow_context_destroy(ctx: *mut CipherflowContext) {
    if ctx.is_null() {
        return;
    }
    let handle = Box::from_raw(ctx);
    if panic::catch_unwind(AssertUnwindSafe(|| handle.inner.shutdown())).is_err() {
        error!("Panic while shutting down context");
    }
}

#[no_mangle]
/// # Safety
/// `ctx` must be a live context handle, `name` a NUL-terminated string and `out_id`
/// valid for writing one `u32`.
pub unsafe extern "C" fn cipherflow_context_register_partition(
    ctx: *const CipherflowContext,
    name: *const c_char,
    lwe_dim: usize,
    glwe_dim: usize,
    poly_size: usize,
    out_id: *mut u32,
) -> i32 {
    guard("cipherflow_context_register_partition", || {
        let ctx = context(ctx)?;
        if name.is_null() {
            return Err(AbiError::null("name"));
        }
        if out_id.is_null() {
            return Err(AbiError::null("out_id"));
        }
        let name = CStr::from_ptr(name)
            .to_str()
            .map_err(|e| AbiError::new(StatusCode::InvalidArgument, format!("name: {}", e)))?;
        let partition = Partition::builder(name, lwe_dim, glwe_dim, poly_size)
            .build()
            .map_err(RuntimeError::from)?;
        let id = ctx.register_partition(partition)?;
        *out_id = id.0;
        Ok(())
    })
}

#[no_mangle]
/// # Safety
/// `ctx` must be a live context handle and `out_len` valid for writing one `usize`.
pub unsafe extern "C" fn cipherflow_ciphertext_len(
    ctx: *const CipherflowContext,
    partition: u32,
    out_len: *mut usize,
) -> i32 {
    guard("cipherflow_ciphertext_len", || {
        let ctx = context(ctx)?;
        if out_len.is_null() {
            return Err(AbiError::null("out_len"));
        }
        *out_len = registered_partition(ctx, partition)?.ciphertext_len();
        Ok(())
    })
}

#[no_mangle]
/// Encrypt `message` under the context's key set for `partition`
///
/// # Safety
/// `ctx` must be a live context handle and `out` valid for writing `out_len` words.
pub unsafe extern "C" fn cipherflow_encrypt_lwe(
    ctx: *const CipherflowContext,
    partition: u32,
    message: u64,
    nonce: u64,
    out: *mut u64,
    out_len: usize,
) -> i32 {
    guard("cipherflow_encrypt_lwe", || {
        let ctx = context(ctx)?;
        let out = words_mut(out, out_len, "out")?;
        let registered = registered_partition(ctx, partition)?;
        check_len("output ciphertext", registered.ciphertext_len(), out.len())?;
        let keys = ctx.key_set(&registered)?;
        out.copy_from_slice(&keys.encrypt(message, nonce));
        Ok(())
    })
}

#[no_mangle]
/// # Safety
/// `ctx` must be a live context handle, `input` valid for reading `input_len` words and
/// `out_message` valid for writing one `u64`.
pub unsafe extern "C" fn cipherflow_decrypt_lwe(
    ctx: *const CipherflowContext,
    partition: u32,
    input: *const u64,
    input_len: usize,
    out_message: *mut u64,
) -> i32 {
    guard("cipherflow_decrypt_lwe", || {
        let ctx = context(ctx)?;
        let input = words(input, input_len, "input")?;
        if out_message.is_null() {
            return Err(AbiError::null("out_message"));
        }
        let registered = registered_partition(ctx, partition)?;
        check_len("input ciphertext", registered.ciphertext_len(), input.len())?;
        let keys = ctx.key_set(&registered)?;
        *out_message = keys.decrypt(input).map_err(RuntimeError::from)?;
        Ok(())
    })
}

#[no_mangle]
/// # Safety
/// `ctx` must be a live context handle; every pointer must be valid for its length in
/// words and `out` must not overlap the inputs.
pub unsafe extern "C" fn cipherflow_add_lwe(
    ctx: *const CipherflowContext,
    partition: u32,
    out: *mut u64,
    out_len: usize,
    lhs: *const u64,
    lhs_len: usize,
    rhs: *const u64,
    rhs_len: usize,
) -> i32 {
    guard("cipherflow_add_lwe", || {
        let ctx = context(ctx)?;
        let lhs = words(lhs, lhs_len, "lhs")?;
        let rhs = words(rhs, rhs_len, "rhs")?;
        let out = words_mut(out, out_len, "out")?;
        run_lwe_op(ctx, partition, OpKind::Add, out, &[lhs, rhs])
    })
}

#[no_mangle]
/// # Safety
/// `ctx` must be a live context handle; both pointers must be valid for their length in
/// words and must not overlap.
pub unsafe extern "C" fn cipherflow_neg_lwe(
    ctx: *const CipherflowContext,
    partition: u32,
    out: *mut u64,
    out_len: usize,
    input: *const u64,
    input_len: usize,
) -> i32 {
    guard("cipherflow_neg_lwe", || {
        let ctx = context(ctx)?;
        let input = words(input, input_len, "input")?;
        let out = words_mut(out, out_len, "out")?;
        run_lwe_op(ctx, partition, OpKind::Neg, out, &[input])
    })
}

#[no_mangle]
/// # Safety
/// `ctx` must be a live context handle; both pointers must be valid for their length in
/// words and must not overlap.
pub unsafe extern "C" fn cipherflow_mul_plain_lwe(
    ctx: *const CipherflowContext,
    partition: u32,
    out: *mut u64,
    out_len: usize,
    input: *const u64,
    input_len: usize,
    constant: u64,
) -> i32 {
    guard("cipherflow_mul_plain_lwe", || {
        let ctx = context(ctx)?;
        let input = words(input, input_len, "input")?;
        let out = words_mut(out, out_len, "out")?;
        run_lwe_op(ctx, partition, OpKind::MulPlain(constant), out, &[input])
    })
}

#[no_mangle]
/// Programmable bootstrap of `input` through `table`
///
/// # Safety
/// `ctx` must be a live context handle; every pointer must be valid for its length in
/// words and `out` must not overlap the other buffers.
pub unsafe extern "C" fn cipherflow_lookup_table_lwe(
    ctx: *const CipherflowContext,
    partition: u32,
    out: *mut u64,
    out_len: usize,
    input: *const u64,
    input_len: usize,
    table: *const u64,
    table_len: usize,
) -> i32 {
    guard("cipherflow_lookup_table_lwe", || {
        let ctx = context(ctx)?;
        let input = words(input, input_len, "input")?;
        let table = words(table, table_len, "table")?;
        let out = words_mut(out, out_len, "out")?;
        let registered = registered_partition(ctx, partition)?;
        // Tables cover either the full plaintext space or the message space only
        if table.len() != registered.message_modulus as usize {
            check_len(
                "lookup table",
                registered.plaintext_modulus() as usize,
                table.len(),
            )?;
        }
        run_lwe_op(
            ctx,
            partition,
            OpKind::ApplyLookupTable(table.to_vec()),
            out,
            &[input],
        )
    })
}

#[no_mangle]
/// Load a program from its JSON artifact
///
/// # Safety
/// `json` must be valid for reading `json_len` bytes and `out` valid for writing one
/// pointer. The returned handle must be released with `cipherflow_program_free`.
pub unsafe extern "C" fn cipherflow_program_load(
    json: *const c_char,
    json_len: usize,
    out: *mut *mut CipherflowProgram,
) -> i32 {
    guard("cipherflow_program_load", || {
        if json.is_null() {
            return Err(AbiError::null("json"));
        }
        if out.is_null() {
            return Err(AbiError::null("out"));
        }
        let bytes = std::slice::from_raw_parts(json as *const u8, json_len);
        let json = std::str::from_utf8(bytes)
            .map_err(|e| AbiError::new(StatusCode::InvalidArgument, format!("json: {}", e)))?;
        let artifact = ProgramArtifact::from_json(json)?;
        let inner = load_program(&artifact)?;
        *out = Box::into_raw(Box::new(CipherflowProgram { inner }));
        Ok(())
    })
}

#[no_mangle]
/// # Safety
/// `program` must be null or a handle from `cipherflow_program_load` not yet freed.
pub unsafe extern "C" fn cipherflow_program_free(program: *mut CipherflowProgram) {
    if !program.is_null() {
        drop(Box::from_raw(program));
    }
}

/// Words one program value occupies in the flat buffers
fn value_words(ctx: &Context, program: &Program, value: ValueId) -> AbiResult<usize> {
    if ctx.mode() == ExecutionMode::Simulation {
        return Ok(1);
    }
    let graph = program.graph();
    let slot = graph
        .value_slot(value)
        .ok_or(RuntimeError::UnknownValue(value))?;
    let partition = program
        .partitions()
        .get(graph.slot_partition(slot))
        .ok_or_else(|| RuntimeError::UnknownPartition(graph.slot_partition(slot).to_string()))?;
    Ok(partition.ciphertext_len())
}

#[no_mangle]
/// Call a loaded program on concatenated argument buffers
///
/// `inputs` holds every program argument back to back, each one ciphertext of its
/// partition; `outputs` receives the program outputs the same way. In simulation mode
/// each argument and output is a single cleartext word.
///
/// # Safety
/// `ctx` and `program` must be live handles; `inputs` and `outputs` must be valid for
/// their length in words and must not overlap.
pub unsafe extern "C" fn cipherflow_program_call(
    ctx: *const CipherflowContext,
    program: *const CipherflowProgram,
    inputs: *const u64,
    inputs_len: usize,
    outputs: *mut u64,
    outputs_len: usize,
) -> i32 {
    guard("cipherflow_program_call", || {
        let ctx = context(ctx)?;
        let program = program
            .as_ref()
            .map(|handle| &handle.inner)
            .ok_or_else(|| AbiError::new(StatusCode::InvalidHandle, "program handle is null"))?;
        let inputs = words(inputs, inputs_len, "inputs")?;
        let outputs = words_mut(outputs, outputs_len, "outputs")?;

        let input_words = program
            .inputs()
            .iter()
            .map(|&(value, _)| value_words(ctx, program, value))
            .collect::<AbiResult<Vec<_>>>()?;
        let output_words = program
            .outputs()
            .iter()
            .map(|&value| value_words(ctx, program, value))
            .collect::<AbiResult<Vec<_>>>()?;
        check_len("program inputs", input_words.iter().sum(), inputs.len())?;
        check_len("program outputs", output_words.iter().sum(), outputs.len())?;

        let simulation = ctx.mode() == ExecutionMode::Simulation;
        let mut offset = 0;
        let mut values = Vec::with_capacity(input_words.len());
        for len in input_words {
            let chunk = &inputs[offset..offset + len];
            values.push(if simulation {
                Value::Cleartext(chunk[0])
            } else {
                Value::Ciphertext(chunk.to_vec())
            });
            offset += len;
        }

        let results = program.call(ctx, values)?;
        let mut offset = 0;
        for ((value, len), &value_id) in results.iter().zip(output_words).zip(program.outputs()) {
            let target = &mut outputs[offset..offset + len];
            match value {
                Value::Ciphertext(ciphertext) => {
                    check_len(&format!("output {}", value_id), len, ciphertext.len())?;
                    target.copy_from_slice(ciphertext);
                }
                Value::Simulated(_) | Value::Cleartext(_) => {
                    target[0] = program.decrypt_value(ctx, value_id, value)?;
                }
            }
            offset += len;
        }
        Ok(())
    })
}
