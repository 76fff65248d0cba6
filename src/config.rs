//! Session configuration.
//!
//! The original program kept these as process globals; here they travel
//! on an explicit `Config` handed to `Context::new` so two sessions can
//! disagree about levels or tracing.

pub type Level = i32;

/// The level string in the data file was unrecognizable.
pub const ERROR_LEVEL: Level = 0;
/// Reserved for "no level specified".
pub const NO_LEVEL: Level = 1;

/// Precedence 0-10 folds into tiling scores as `1 << (p * PRECEDENCE_SHIFT)`,
/// so any tile of better precedence trumps all tiles of lesser precedence
/// and the tiling with the most high-precedence tiles wins.
pub const PRECEDENCE_SHIFT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DanceType {
    /// Don't enforce a geometry on the session.
    Unspecified,
    TwoCouple,
    FourCouple,
    SixCouple,
    Hexagonal,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub dance_type: DanceType,
    /// Level names in increasing order; index is the level value.
    pub levels: Vec<String>,
    /// Variant precedence names; index is the precedence value.
    pub precedences: Vec<String>,
    pub verbose_parsing: bool,
    pub verbose_matching: bool,
    pub verbose_breathing: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            dance_type: DanceType::FourCouple,
            levels: [
                "<error>",
                "<none>",
                "Basic",
                "Mainstream",
                "Plus",
                "Advanced-1",
                "Advanced-2",
                "Challenge-1",
                "Challenge-2",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            precedences: ["normal", "high", "higher", "highest"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            verbose_parsing: false,
            verbose_matching: false,
            verbose_breathing: false,
        }
    }
}

impl Config {
    /// Level value for a name, or ERROR_LEVEL when unknown.
    pub fn level_value(&self, name: &str) -> Level {
        let name = name.trim();
        if name.is_empty() {
            return NO_LEVEL;
        }
        self.levels
            .iter()
            .position(|l| l.eq_ignore_ascii_case(name))
            .map(|i| i as Level)
            .unwrap_or(ERROR_LEVEL)
    }

    pub fn level_name(&self, level: Level) -> &str {
        self.levels
            .get(level as usize)
            .map(|s| s.as_str())
            .unwrap_or("<error>")
    }

    pub fn precedence_value(&self, name: &str) -> u32 {
        self.precedences
            .iter()
            .position(|p| p.eq_ignore_ascii_case(name.trim()))
            .unwrap_or(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_lookup_is_case_insensitive() {
        let config = Config::default();
        assert_eq!(config.level_value("plus"), config.level_value("Plus"));
        assert!(config.level_value("Plus") > NO_LEVEL);
    }

    #[test]
    fn unknown_level_maps_to_error_level() {
        let config = Config::default();
        assert_eq!(config.level_value("Jazzercise"), ERROR_LEVEL);
    }

    #[test]
    fn empty_level_name_means_no_level() {
        let config = Config::default();
        assert_eq!(config.level_value("  "), NO_LEVEL);
    }

    #[test]
    fn precedence_defaults_to_normal() {
        let config = Config::default();
        assert_eq!(config.precedence_value("high"), 1);
        assert_eq!(config.precedence_value("nonsense"), 0);
    }
}
