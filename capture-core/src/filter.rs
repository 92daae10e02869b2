use wildmatch::WildMatch;

/// Host scope for capture
#[derive(Debug, Default)]
pub struct ScopeMatcher {
    include: Vec<WildMatch>,
    exclude: Vec<WildMatch>,
}

impl ScopeMatcher {
    /// Create a new ScopeMatcher from wildcard host patterns
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include: include.iter().map(|p| WildMatch::new(&p.to_ascii_lowercase())).collect(),
            exclude: exclude.iter().map(|p| WildMatch::new(&p.to_ascii_lowercase())).collect(),
        }
    }

    pub fn from_config(config: &crate::config::CaptureConfig) -> Self {
        Self::new(&config.include_hosts, &config.ignore_hosts)
    }

    /// Check if a host should be captured
    ///
    /// Logic:
    /// 1. If an exclusion matches, return false.
    /// 2. If the include list is empty, return true.
    /// 3. Otherwise return true only if an include pattern matches.
    pub fn is_captured(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();

        if self.exclude.iter().any(|pattern| pattern.matches(&host)) {
            return false;
        }

        if self.include.is_empty() {
            return true;
        }

        self.include.iter().any(|pattern| pattern.matches(&host))
    }
}
