/// Transient files CAD tools, office suites and the OS leave next to real
/// documents, plus our own in-progress downloads.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "~$*",
    ".~lock.*#",
    "*.partial",
    "*.swp",
    "*.tmp",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
];

#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE_PATTERNS.iter().map(|p| p.to_string()))
    }
}

impl IgnoreRules {
    pub fn new<I>(patterns: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn with_extra<I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.patterns.extend(
            extra
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        );
        self
    }

    /// Patterns containing `/` match the whole vault-relative path; all others
    /// match any single path segment, so an ignored folder hides its contents.
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        self.patterns.iter().any(|pattern| {
            if pattern.contains('/') {
                wildcard_match(pattern, relative_path)
            } else {
                relative_path
                    .split('/')
                    .any(|segment| wildcard_match(pattern, segment))
            }
        })
    }
}

/// `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(star_at) = star {
            pi = star_at + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
