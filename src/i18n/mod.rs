//! Internationalization (i18n) module.
//!
//! Translations are embedded JSON files keyed by dotted paths, e.g.
//! `move.usage`. Missing keys fall back to English, then to the key itself.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::Value;
use tracing::warn;

const FALLBACK: &str = "en";

/// LangCode -> translation tree
static TRANSLATIONS: OnceLock<HashMap<&'static str, Value>> = OnceLock::new();

fn translations() -> &'static HashMap<&'static str, Value> {
    TRANSLATIONS.get_or_init(|| {
        let mut map = HashMap::new();
        for (lang, json) in [("en", include_str!("en.json")), ("id", include_str!("id.json"))] {
            match serde_json::from_str(json) {
                Ok(value) => {
                    map.insert(lang, value);
                }
                Err(e) => warn!("Invalid {} translations: {}", lang, e),
            }
        }
        map
    })
}

pub fn is_supported(lang: &str) -> bool {
    translations().contains_key(lang)
}

/// Text for `key` in `lang`.
pub fn get_text(lang: &str, key: &str) -> String {
    [lang, FALLBACK]
        .into_iter()
        .find_map(|lang| translations().get(lang).and_then(|tree| resolve_key(tree, key)))
        .unwrap_or_else(|| key.to_string())
}

/// Text for `key` with `{name}` placeholders filled from `args`.
pub fn format_text(lang: &str, key: &str, args: &[(&str, &str)]) -> String {
    args.iter()
        .fold(get_text(lang, key), |text, (name, value)| {
            text.replace(&format!("{{{}}}", name), value)
        })
}

/// Pick the user's Telegram client language when it is one we speak.
pub fn resolve_locale(user_lang: Option<&str>, default_lang: &str) -> String {
    user_lang
        .map(|l| l.split('-').next().unwrap_or(l).to_lowercase())
        .filter(|l| is_supported(l))
        .unwrap_or_else(|| default_lang.to_string())
}

fn resolve_key(tree: &Value, key: &str) -> Option<String> {
    key.split('.')
        .try_fold(tree, |node, part| node.get(part))
        .and_then(Value::as_str)
        .map(str::to_string)
}
