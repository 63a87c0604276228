//! Tokenization / detokenization helpers.

use std::ffi::c_char;

use crate::engine::Token;
use crate::error::{BridgeError, Result};

/// Tokenize `text` using the model's vocabulary.
pub fn tokenize(
    vocab: *const llama_sys::llama_vocab,
    text: &str,
    add_special: bool,
    parse_special: bool,
) -> Result<Vec<Token>> {
    let len = i32::try_from(text.len())
        .map_err(|_| BridgeError::TokenizationFailed("prompt too long".into()))?;

    // First call: query required buffer size (returns negative count).
    let n = unsafe {
        llama_sys::llama_tokenize(
            vocab,
            text.as_ptr() as *const c_char,
            len,
            std::ptr::null_mut(),
            0,
            add_special,
            parse_special,
        )
    };
    if n == i32::MIN {
        return Err(BridgeError::TokenizationFailed(
            "token count overflows int32".into(),
        ));
    }

    let mut tokens = vec![0 as Token; n.unsigned_abs() as usize];
    let actual = unsafe {
        llama_sys::llama_tokenize(
            vocab,
            text.as_ptr() as *const c_char,
            len,
            tokens.as_mut_ptr(),
            tokens.len() as i32,
            add_special,
            parse_special,
        )
    };

    if actual < 0 {
        return Err(BridgeError::TokenizationFailed(format!(
            "llama_tokenize returned {actual}"
        )));
    }

    tokens.truncate(actual as usize);
    Ok(tokens)
}

/// Raw piece bytes for `token`, control tokens rendered.
pub fn token_to_bytes(vocab: *const llama_sys::llama_vocab, token: Token) -> Vec<u8> {
    let mut buf = vec![0u8; 32];
    let mut len = piece_into(vocab, token, &mut buf);
    if len < 0 {
        // Buffer too small; -len is the size needed.
        buf.resize(len.unsigned_abs() as usize, 0);
        len = piece_into(vocab, token, &mut buf);
    }
    buf.truncate(len.max(0) as usize);
    buf
}

fn piece_into(vocab: *const llama_sys::llama_vocab, token: Token, buf: &mut [u8]) -> i32 {
    unsafe {
        llama_sys::llama_token_to_piece(
            vocab,
            token,
            buf.as_mut_ptr() as *mut c_char,
            buf.len() as i32,
            0,    // lstrip
            true, // special
        )
    }
}
