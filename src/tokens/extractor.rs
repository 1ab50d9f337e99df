//! Chain-specific token address extraction.
//!
//! Mentions that structurally resemble an address are classified as EVM
//! (0x + 40 hex chars) or Solana (base58 decoding to exactly 32 bytes).
//! EVM checksum casing is advisory only; lowercase and mixed-case forms are
//! both accepted.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{Chain, TokenAddress};

lazy_static! {
    static ref EVM_RE: Regex = Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("static regex");
    static ref BASE58_RE: Regex =
        Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("static regex");
}

/// Cheap structural prefilter: length and alphabet only.
pub fn looks_like_address(mention: &str) -> bool {
    let len = mention.len();
    if len == 42 && mention.starts_with("0x") {
        return mention[2..].bytes().all(|b| b.is_ascii_hexdigit());
    }
    (32..=44).contains(&len) && BASE58_RE.is_match(mention)
}

/// Classify one candidate string.
pub fn classify(mention: &str) -> Chain {
    if EVM_RE.is_match(mention) {
        return Chain::Evm;
    }
    if BASE58_RE.is_match(mention) {
        if let Ok(bytes) = bs58::decode(mention).into_vec() {
            if bytes.len() == 32 {
                return Chain::Solana;
            }
        }
    }
    Chain::Unknown
}

/// Parse and validate the address-shaped subset of `mentions`.
///
/// The returned list preserves input order; duplicates are de-duplicated
/// case-insensitively within one call.
pub fn extract(mentions: &[String]) -> Vec<TokenAddress> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();

    for mention in mentions {
        let mention = mention.trim();
        if !looks_like_address(mention) {
            continue;
        }
        let folded = mention.to_lowercase();
        if seen.iter().any(|s| *s == folded) {
            continue;
        }
        seen.push(folded);

        let chain = classify(mention);
        let valid = chain != Chain::Unknown;
        out.push(TokenAddress::new(mention, chain, valid));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDT: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";
    const WSOL: &str = "So11111111111111111111111111111111111111112";

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classifies_evm_and_solana() {
        assert_eq!(classify(USDT), Chain::Evm);
        assert_eq!(classify(&USDT.to_lowercase()), Chain::Evm);
        assert_eq!(classify(WSOL), Chain::Solana);
    }

    #[test]
    fn short_base58_is_unknown() {
        // Valid base58 alphabet but does not decode to 32 bytes.
        assert_eq!(classify("1111111111111111111111111111111111111111"), Chain::Unknown);
    }

    #[test]
    fn prose_words_do_not_survive_prefilter() {
        let out = extract(&strings(&["buy", "ETH", "now", "gm"]));
        assert!(out.is_empty());
    }

    #[test]
    fn preserves_order_and_dedupes_case_insensitively() {
        let lower = USDT.to_lowercase();
        let out = extract(&strings(&[WSOL, USDT, &lower, WSOL]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].literal, WSOL);
        assert_eq!(out[0].chain, Chain::Solana);
        assert_eq!(out[1].literal, USDT);
        assert_eq!(out[1].chain, Chain::Evm);
    }

    #[test]
    fn wallet_shaped_base58_still_classifies_as_solana() {
        // A wallet address is structurally indistinguishable from a mint;
        // downstream filtering drops it when providers return nothing.
        let wallet = "4Nd1mYQviZjVEnFxe7sjTW6HyFkbWEmVnEwv3yH6BJ1D";
        assert_eq!(classify(wallet), Chain::Solana);
    }

    #[test]
    fn extract_is_idempotent_on_its_own_output() {
        let first = extract(&strings(&[USDT, WSOL]));
        let literals: Vec<String> = first.iter().map(|a| a.literal.clone()).collect();
        let second = extract(&literals);
        let again: Vec<String> = second.iter().map(|a| a.literal.clone()).collect();
        assert_eq!(literals, again);
    }
}
