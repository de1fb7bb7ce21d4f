/// Canonical name of a controller, kept as an ordered sequence of word
/// fragments. Construction lowercases each fragment and strips everything
/// that is not an ASCII letter, so the derived tokens are always safe to use
/// as a metric label (`snake_case`) or a logger prefix (`kebab-case`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerName {
    words: Vec<String>,
}

impl ControllerName {
    pub fn new(words: &[&str]) -> Self {
        let words = words
            .iter()
            .map(|w| {
                w.chars()
                    .filter(|c| c.is_ascii_alphabetic())
                    .map(|c| c.to_ascii_lowercase())
                    .collect::<String>()
            })
            .filter(|w| !w.is_empty())
            .collect();
        Self { words }
    }

    pub fn metrics_name(&self) -> String {
        self.words.join("_")
    }

    pub fn logger_name(&self) -> String {
        self.words.join("-")
    }
}

impl std::fmt::Display for ControllerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.logger_name())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tokens_are_lowercased_and_joined() {
        let name = ControllerName::new(&["Nginx", "Ingress", "Controller"]);
        assert_eq!(name.metrics_name(), "nginx_ingress_controller");
        assert_eq!(name.logger_name(), "nginx-ingress-controller");
    }

    #[test]
    fn non_letters_are_stripped() {
        let name = ControllerName::new(&["external-dns2", "re source s"]);
        assert_eq!(name.metrics_name(), "externaldns_resources");
        assert_eq!(name.logger_name(), "externaldns-resources");
    }

    #[test]
    fn empty_fragments_are_dropped() {
        let name = ControllerName::new(&["spc", "123", "ingress"]);
        assert_eq!(name.metrics_name(), "spc_ingress");
    }

    #[test]
    fn equality_follows_the_fragment_sequence() {
        assert_eq!(
            ControllerName::new(&["a", "b"]),
            ControllerName::new(&["A", "B!"])
        );
        assert_ne!(
            ControllerName::new(&["a", "b"]),
            ControllerName::new(&["b", "a"])
        );
    }

    #[test]
    fn token_shapes_hold() {
        let name = ControllerName::new(&["Keyvault", "SPC"]);
        let metrics = name.metrics_name();
        let logger = name.logger_name();
        assert!(metrics
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_'));
        assert!(logger.chars().all(|c| c.is_ascii_lowercase() || c == '-'));
        assert!(!metrics.starts_with('_') && !metrics.ends_with('_'));
        assert!(!logger.starts_with('-') && !logger.ends_with('-'));
    }
}
