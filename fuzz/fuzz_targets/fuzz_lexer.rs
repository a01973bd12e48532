#![no_main]

use libfuzzer_sys::fuzz_target;
use vesper_core::state::GlobalState;
use vesper_syntax::lexer::Lexer;
use vesper_syntax::token::Token;
use vesper_syntax::zio::Zio;

fuzz_target!(|data: &[u8]| {
    // The scanner must never panic on any input — errors are fine,
    // panics are bugs.
    let mut state = GlobalState::new();
    let mut lx = match Lexer::new(&mut state, Zio::from_bytes(data), "=fuzz", None) {
        Ok(lx) => lx,
        Err(_) => return,
    };
    loop {
        match lx.advance() {
            Ok(tok) => {
                if tok.token == Token::Eof {
                    break;
                }
            }
            Err(_) => break,
        }
    }
});
