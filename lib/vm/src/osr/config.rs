use std::str::FromStr;
use tracing::warn;

/// Tuning of on-stack replacement.
///
/// Every field can be overridden through a `STACKCRAWL_OSR_*` environment
/// variable, see [`OsrConfig::from_env`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsrConfig {
    /// Whether counted patchpoints may trigger a transition at all.
    /// Required patchpoints ignore this switch.
    pub enabled: bool,
    /// Hits of one patchpoint before its OSR variant is compiled.
    pub hit_limit: i32,
    /// Value the method's patchpoint counter is reset to after every hit.
    pub counter_bump: i32,
    /// Patchpoints with a lower id never trigger.
    pub low_id: u32,
    /// Patchpoints with a higher id never trigger.
    pub high_id: u32,
    /// Backoffs a required patchpoint performs while another thread compiles
    /// before the process is terminated.
    pub required_max_backoffs: u32,
}

impl Default for OsrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hit_limit: 10,
            counter_bump: 1000,
            low_id: 0,
            high_id: u32::MAX,
            required_max_backoffs: 10_000,
        }
    }
}

impl OsrConfig {
    /// The default configuration with the process environment applied.
    ///
    /// | Variable | Field |
    /// | --- | --- |
    /// | `STACKCRAWL_OSR_ENABLE` | `enabled` (`0` or `1`) |
    /// | `STACKCRAWL_OSR_HIT_LIMIT` | `hit_limit` |
    /// | `STACKCRAWL_OSR_COUNTER_BUMP` | `counter_bump` |
    /// | `STACKCRAWL_OSR_LOW_ID` | `low_id` |
    /// | `STACKCRAWL_OSR_HIGH_ID` | `high_id` |
    /// | `STACKCRAWL_OSR_MAX_BACKOFFS` | `required_max_backoffs` |
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// The default configuration with the variables `lookup` returns applied.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(enabled) = lookup("STACKCRAWL_OSR_ENABLE") {
            match enabled.trim() {
                "1" => config.enabled = true,
                "0" => config.enabled = false,
                other => warn!(value = other, "ignoring invalid STACKCRAWL_OSR_ENABLE"),
            }
        }
        overlay(&lookup, "STACKCRAWL_OSR_HIT_LIMIT", &mut config.hit_limit);
        overlay(&lookup, "STACKCRAWL_OSR_COUNTER_BUMP", &mut config.counter_bump);
        overlay(&lookup, "STACKCRAWL_OSR_LOW_ID", &mut config.low_id);
        overlay(&lookup, "STACKCRAWL_OSR_HIGH_ID", &mut config.high_id);
        overlay(&lookup, "STACKCRAWL_OSR_MAX_BACKOFFS", &mut config.required_max_backoffs);
        config
    }

    /// Whether the patchpoint with `id` lies in the configured stress window.
    pub fn in_window(&self, id: u32) -> bool {
        self.low_id <= id && id <= self.high_id
    }
}

fn overlay<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, field: &mut T) {
    let Some(value) = lookup(name) else {
        return;
    };
    match value.trim().parse() {
        Ok(parsed) => *field = parsed,
        Err(_) => warn!(variable = name, value = %value, "ignoring invalid OSR setting"),
    }
}
