//! Routing decisions. Everything here is a pure function of its inputs: the
//! session layer asks `route` once per (message, binding) pair and never
//! feeds any state back in.

use crate::protocol::ExchangeType;
use log::error;

/// Routing keys permit `[A-Za-z0-9._]`.
pub fn is_valid_routing_key(routing_key: &str) -> bool {
    for ch in routing_key.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' {
            continue;
        }
        error!("routing key {:?} has illegal character {:?}", routing_key, ch);
        return false;
    }
    true
}

/// Binding keys additionally permit `*` (one word) and `#` (zero or more
/// words). A word may not mix a wildcard with other characters, and the
/// pairs `##`, `#*`, `*#` are rejected; `*.*` is two independent slots and
/// stays legal.
pub fn is_valid_binding_key(binding_key: &str) -> bool {
    for ch in binding_key.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '*' | '#') {
            continue;
        }
        error!("binding key {:?} has illegal character {:?}", binding_key, ch);
        return false;
    }
    let words = split_words(binding_key);
    for word in &words {
        if word.len() > 1 && (word.contains('*') || word.contains('#')) {
            error!("binding key {:?} mixes a wildcard into word {:?}", binding_key, word);
            return false;
        }
    }
    for pair in words.windows(2) {
        if matches!((pair[0], pair[1]), ("#", "#") | ("#", "*") | ("*", "#")) {
            error!("binding key {:?} has adjacent wildcards", binding_key);
            return false;
        }
    }
    true
}

/// Decides whether a message published with `routing_key` reaches the queue
/// behind a binding with `binding_key`.
pub fn route(exchange_type: ExchangeType, routing_key: &str, binding_key: &str) -> bool {
    match exchange_type {
        ExchangeType::Direct => routing_key == binding_key,
        ExchangeType::Fanout => true,
        ExchangeType::Topic => topic_match(routing_key, binding_key),
        ExchangeType::Unknown => false,
    }
}

/// Empty words (from `..`) are skipped rather than matched.
fn split_words(key: &str) -> Vec<&str> {
    key.split('.').filter(|word| !word.is_empty()).collect()
}

// Two-dimensional dynamic program over binding words x routing words:
// dp[i][j] is true when the first i binding words cover the first j routing
// words. Literal words and `*` consume exactly one routing word; `#` may
// consume zero (dp[i-1][j]), one more (dp[i][j-1]), or exactly one
// (dp[i-1][j-1]).
fn topic_match(routing_key: &str, binding_key: &str) -> bool {
    let bind_words = split_words(binding_key);
    let route_words = split_words(routing_key);
    let n = bind_words.len();
    let m = route_words.len();
    let mut dp = vec![vec![false; m + 1]; n + 1];
    dp[0][0] = true;
    for i in 1..=n {
        if bind_words[i - 1] != "#" {
            break;
        }
        dp[i][0] = true;
    }
    for i in 1..=n {
        for j in 1..=m {
            if bind_words[i - 1] == route_words[j - 1] || bind_words[i - 1] == "*" {
                dp[i][j] = dp[i - 1][j - 1];
            } else if bind_words[i - 1] == "#" {
                dp[i][j] = dp[i - 1][j - 1] || dp[i - 1][j] || dp[i][j - 1];
            }
        }
    }
    dp[n][m]
}
