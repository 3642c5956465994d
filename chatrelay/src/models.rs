use std::collections::BTreeMap;

use log::warn;

pub const STANDARD_MODEL: &str = "gpt-3.5-turbo";
pub const PREMIUM_MODEL: &str = "gpt-4";

/// Permission level to model id, used when no `[models]` table is configured.
pub fn default_models() -> BTreeMap<i64, String> {
    BTreeMap::from([
        (1, STANDARD_MODEL.to_string()),
        (2, PREMIUM_MODEL.to_string()),
    ])
}

/// Picks the model a user of `perm_level` may call, if any.
pub fn select_model(models: &BTreeMap<i64, String>, perm_level: i64) -> Option<&str> {
    let model = models.get(&perm_level).map(String::as_str);
    if model.is_none() {
        warn!("No model assigned to permission level {}", perm_level);
    }
    model
}
