//! Flag-list assembly for marketplace commands.
//!
//! Keyword flags follow the command library's conventions: a `true` switch
//! becomes a bare `--flag`, `false` and unset values are omitted, anything
//! else becomes a `--flag value` pair. Some remote commands want hyphenated
//! flag names and others underscored, so hyphenation is opt-in per call.

/// Ordered set of keyword flags for one command invocation.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    entries: Vec<(String, FlagValue)>,
}

#[derive(Debug, Clone)]
enum FlagValue {
    Switch(bool),
    Value(String),
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Boolean switch; emitted as a bare `--name` only when `on` is true.
    pub fn switch(mut self, name: &str, on: bool) -> Self {
        self.entries.push((name.to_string(), FlagValue::Switch(on)));
        self
    }

    /// Valued flag, emitted as `--name value`.
    pub fn value(mut self, name: &str, value: impl ToString) -> Self {
        self.entries
            .push((name.to_string(), FlagValue::Value(value.to_string())));
        self
    }

    /// Optional valued flag; omitted entirely when `value` is `None`.
    pub fn opt(self, name: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.value(name, v),
            None => self,
        }
    }

    /// Render to argv tokens. Switches come first, then valued pairs,
    /// preserving insertion order within each group.
    pub fn render(&self, hyphenate: bool) -> Vec<String> {
        let name = |raw: &str| {
            if hyphenate {
                format!("--{}", raw.replace('_', "-"))
            } else {
                format!("--{}", raw)
            }
        };

        let mut argv = Vec::new();
        for (key, value) in &self.entries {
            if let FlagValue::Switch(true) = value {
                argv.push(name(key));
            }
        }
        for (key, value) in &self.entries {
            if let FlagValue::Value(v) = value {
                argv.push(name(key));
                argv.push(v.clone());
            }
        }
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_true_is_bare_flag() {
        let argv = Flags::new().switch("force", true).render(false);
        assert_eq!(argv, vec!["--force"]);
    }

    #[test]
    fn test_switch_false_and_none_are_omitted() {
        let argv = Flags::new()
            .switch("force", false)
            .opt("price", None::<f64>)
            .render(false);
        assert!(argv.is_empty());
    }

    #[test]
    fn test_values_become_pairs() {
        let argv = Flags::new()
            .value("disk", 10.0)
            .opt("label", Some("train"))
            .render(false);
        assert_eq!(argv, vec!["--disk", "10", "--label", "train"]);
    }

    #[test]
    fn test_hyphenation_only_when_requested() {
        let flags = Flags::new().value("disk_space", 5.0);
        assert_eq!(flags.render(false), vec!["--disk_space", "5"]);
        assert_eq!(flags.render(true), vec!["--disk-space", "5"]);
    }

    #[test]
    fn test_switches_render_before_values() {
        let argv = Flags::new()
            .value("image", "pytorch/pytorch")
            .switch("jupyter", true)
            .render(false);
        assert_eq!(argv, vec!["--jupyter", "--image", "pytorch/pytorch"]);
    }
}
