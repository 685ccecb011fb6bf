//! Text generation engine.
//!
//! # Memory Ownership Rules
//!
//! - Engine handles are owned by the caller; release with `nn_llm_free()`
//! - Strings returned by `nn_llm_dump_config()`, `nn_llm_generate()`,
//!   `nn_llm_response()` and `nn_llm_detokenize()` are owned; release with
//!   `nn_string_free()`
//! - `nn_llm_tokenize()` returns an owned array; release with `nn_llm_tokens_free()`
//! - `LlmContextC::generate_str` is borrowed from the engine handle and stays
//!   valid until the next `nn_llm_get_context()` on that handle or until the
//!   handle is freed
//!
//! # Thread Safety
//!
//! Calls on one engine serialize on its lock. The registry lock is never held
//! while generating.

use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr;

use nnbridge_core::GenerationEngine;
use nnbridge_ffi_common::{cstr_to_str, cstring_new_or_empty, slice_or_empty};

use super::path_arg;
use crate::arrays::{int_array_result, IntArrayC};
use crate::config::required_str;
use crate::error::{boundary, BoundaryError, Result};
use crate::handle::{Handle, HandleKind};
use crate::registry::registry;

/// Counters and timings of an engine's current conversation.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LlmContextC {
    pub prompt_len: i32,
    pub gen_seq_len: i32,
    pub all_seq_len: i32,
    pub load_us: i64,
    pub prefill_us: i64,
    pub decode_us: i64,
    pub sample_us: i64,
    pub current_token: i32,
    /// Text produced by the last generate call (borrowed)
    pub generate_str: *const c_char,
}

impl Default for LlmContextC {
    fn default() -> Self {
        Self {
            prompt_len: 0,
            gen_seq_len: 0,
            all_seq_len: 0,
            load_us: 0,
            prefill_us: 0,
            decode_us: 0,
            sample_us: 0,
            current_token: 0,
            generate_str: ptr::null(),
        }
    }
}

fn with_engine<T>(handle: Handle, f: impl FnOnce(&mut GenerationEngine) -> Result<T>) -> Result<T> {
    let engine = registry().engine(handle)?;
    let mut guard = engine.lock();
    f(&mut guard)
}

/// Create an engine from a JSON config file. The engine must be loaded
/// before generating.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_llm_create(config_path: *const c_char) -> Handle {
    boundary("nn_llm_create", || Handle::NULL, || {
        let path = unsafe { path_arg(config_path, "config_path") }?;
        let engine = GenerationEngine::new(path)?;
        Ok(registry().insert_engine(engine))
    })
}

#[no_mangle]
pub extern "C" fn nn_llm_free(engine: Handle) -> bool {
    boundary("nn_llm_free", || false, || {
        registry().engines.remove(engine).map(|_| true).ok_or(BoundaryError::InvalidHandle {
            handle: engine,
            expected: HandleKind::GenerationEngine,
        })
    })
}

#[no_mangle]
pub extern "C" fn nn_llm_load(engine: Handle) -> bool {
    boundary("nn_llm_load", || false, || {
        with_engine(engine, |e| Ok(e.load()?))?;
        Ok(true)
    })
}

/// Merge a JSON object into the engine config.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_llm_set_config(engine: Handle, json: *const c_char) -> bool {
    boundary("nn_llm_set_config", || false, || {
        let json = unsafe { required_str(json, "json") }?;
        with_engine(engine, |e| Ok(e.set_config(json)?))?;
        Ok(true)
    })
}

/// Current config as JSON (owned).
#[no_mangle]
pub extern "C" fn nn_llm_dump_config(engine: Handle) -> *mut c_char {
    boundary("nn_llm_dump_config", ptr::null_mut, || {
        let json = with_engine(engine, |e| Ok(e.dump_config()?))?;
        Ok(cstring_new_or_empty(&json))
    })
}

/// Decode up to `max_tokens` more tokens and return their text (owned).
#[no_mangle]
pub extern "C" fn nn_llm_generate(engine: Handle, max_tokens: i32) -> *mut c_char {
    boundary("nn_llm_generate", ptr::null_mut, || {
        let max_tokens = nnbridge_ffi_common::count_to_len(max_tokens)?;
        let text = with_engine(engine, |e| Ok(e.generate(max_tokens)?))?;
        Ok(cstring_new_or_empty(&text))
    })
}

/// Answer `prompt` (owned result). `stream` only affects logging.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_llm_response(engine: Handle, prompt: *const c_char, stream: bool) -> *mut c_char {
    boundary("nn_llm_response", ptr::null_mut, || {
        let prompt = unsafe { required_str(prompt, "prompt") }?;
        let text = with_engine(engine, |e| Ok(e.response(prompt, stream)?))?;
        Ok(cstring_new_or_empty(&text))
    })
}

/// Forget the conversation. Load time is kept.
#[no_mangle]
pub extern "C" fn nn_llm_reset(engine: Handle) -> bool {
    boundary("nn_llm_reset", || false, || {
        with_engine(engine, |e| {
            e.reset();
            Ok(())
        })?;
        Ok(true)
    })
}

/// Whether generation has finished. Invalid handles report true so that
/// polling loops terminate.
#[no_mangle]
pub extern "C" fn nn_llm_is_stopped(engine: Handle) -> bool {
    boundary("nn_llm_is_stopped", || true, || with_engine(engine, |e| Ok(e.is_stopped())))
}

/// Token ids for `text` (owned); release with `nn_llm_tokens_free()`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_llm_tokenize(engine: Handle, text: *const c_char) -> IntArrayC {
    int_array_result("nn_llm_tokenize", || {
        if text.is_null() {
            return Err(BoundaryError::NullPointer("text"));
        }
        let text = unsafe { cstr_to_str(text) }?;
        with_engine(engine, |e| Ok(e.tokenize(text)))
    })
}

/// Text for `count` token ids (owned). Ids outside the vocabulary are dropped.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_llm_detokenize(engine: Handle, tokens: *const i32, count: i32) -> *mut c_char {
    boundary("nn_llm_detokenize", ptr::null_mut, || {
        let count = nnbridge_ffi_common::count_to_len(count)?;
        if count > 0 && tokens.is_null() {
            return Err(BoundaryError::NullPointer("tokens"));
        }
        let tokens = unsafe { slice_or_empty(tokens, count) };
        let text = with_engine(engine, |e| Ok(e.detokenize(tokens)))?;
        Ok(cstring_new_or_empty(&text))
    })
}

/// Fill `out` with the engine's counters. The text pointer is owned by the
/// handle; see the module docs for its lifetime.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn nn_llm_get_context(engine: Handle, out: *mut LlmContextC) -> bool {
    boundary("nn_llm_get_context", || false, || {
        let out = unsafe { out.as_mut() }.ok_or(BoundaryError::NullPointer("out"))?;
        let context = with_engine(engine, |e| Ok(e.context().clone()))?;

        let mut reg = registry();
        let entry = reg.engine_entry_mut(engine)?;
        entry.generate_str = CString::new(context.generate_str).unwrap_or_default();

        *out = LlmContextC {
            prompt_len: context.prompt_len as i32,
            gen_seq_len: context.gen_seq_len as i32,
            all_seq_len: context.all_seq_len as i32,
            load_us: context.load_us,
            prefill_us: context.prefill_us,
            decode_us: context.decode_us,
            sample_us: context.sample_us,
            current_token: context.current_token,
            generate_str: entry.generate_str.as_ptr(),
        };
        Ok(true)
    })
}
