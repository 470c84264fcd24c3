use crate::event::{is_modifier_name, is_named_key, KeyPress};

/// Tokens longer than one character are named keys or chords.
fn is_special(token: &str) -> bool {
    token.chars().count() > 1
}

/// Collapse consecutive identical special tokens into one annotated press.
///
/// The collapsed press keeps the first press's delay. `"<[A]>"` three times
/// becomes `"<[A]x3>"`; single printable characters are never merged.
pub fn collapse_runs(presses: &[KeyPress]) -> Vec<KeyPress> {
    let mut out: Vec<KeyPress> = Vec::with_capacity(presses.len());
    let mut i = 0;
    while i < presses.len() {
        let first = &presses[i];
        let mut run = 1;
        if is_special(&first.token) {
            while i + run < presses.len() && presses[i + run].token == first.token {
                run += 1;
            }
        }

        let mut press = first.clone();
        if run > 1 {
            press.token = annotate(&first.token, run);
        }
        out.push(press);
        i += run;
    }
    out
}

fn annotate(token: &str, count: usize) -> String {
    match token.strip_suffix("]>") {
        Some(head) => format!("{head}]x{count}>"),
        None => format!("{token}x{count}"),
    }
}

/// Hide typed content while keeping the shape of the stream.
///
/// Only keysyms from the named-key list and known modifiers survive.
/// Printable characters become `*`, and so does any other key text, whether
/// alone or inside a chord (`<[Control: c]>` becomes `<[Control: *]>`,
/// `<[hunter2]>` becomes `<[*]>`).
pub fn redact_token(token: &str) -> String {
    let Some(inner) = token.strip_prefix("<[") else {
        return "*".to_string();
    };
    let Some(close) = inner.rfind(']') else {
        return "<[*]>".to_string();
    };
    let (body, suffix) = inner.split_at(close);
    if !is_run_suffix(suffix) {
        return "<[*]>".to_string();
    }

    let masked = match body.split_once(": ") {
        Some((mods, key)) => {
            let mods: Vec<&str> = mods
                .split(' ')
                .map(|m| if is_modifier_name(m) { m } else { "*" })
                .collect();
            format!("{}: {}", mods.join(" "), mask_key(key))
        }
        None => mask_key(body).to_string(),
    };
    format!("<[{masked}{suffix}")
}

fn mask_key(key: &str) -> &str {
    if is_named_key(key) {
        key
    } else {
        "*"
    }
}

/// `]>` or a collapsed-run ending such as `]x3>`.
fn is_run_suffix(suffix: &str) -> bool {
    if suffix == "]>" {
        return true;
    }
    suffix
        .strip_prefix("]x")
        .and_then(|s| s.strip_suffix('>'))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// The persisted form of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBatch {
    pub key_tokens: Vec<String>,
    pub timings: Vec<f64>,
    pub nonrepeat_count: i64,
}

pub fn encode_batch(presses: &[KeyPress]) -> EncodedBatch {
    let collapsed = collapse_runs(presses);
    EncodedBatch {
        key_tokens: collapsed.iter().map(|p| redact_token(&p.token)).collect(),
        timings: collapsed.iter().map(|p| p.delay).collect(),
        nonrepeat_count: presses.iter().filter(|p| !p.is_repeat).count() as i64,
    }
}
