//! Job name to pipeline routing.
//!
//! Routes are glob patterns (`mail.*`, `reports.?ly`) bound to default job
//! options, the pipeline name being one of them. Matching ignores case and
//! the route with the longest literal prefix wins, so `some.other.*` beats
//! `some.*` for `some.other.job`. A trailing `.*` also matches the bare
//! prefix: `some.*` routes the job `some`.

use glob::Pattern;
use std::collections::HashMap;

use crate::error::{JobsError, JobsResult};
use crate::job::Options;

struct Route {
    pattern: Pattern,
    bare: Option<Pattern>,
    literal_len: usize,
    options: Options,
}

impl Route {
    fn new(pattern: &str, options: Options) -> JobsResult<Self> {
        let lower = pattern.to_lowercase();
        let compile = |p: &str| {
            Pattern::new(p).map_err(|e| JobsError::Config(format!("dispatch pattern `{pattern}`: {e}")))
        };

        let bare = match lower.strip_suffix(".*") {
            Some(prefix) if !prefix.is_empty() => Some(compile(prefix)?),
            _ => None,
        };

        Ok(Self {
            pattern: compile(&lower)?,
            bare,
            literal_len: lower.find(['*', '?', '[']).unwrap_or(lower.len()),
            options,
        })
    }

    fn matches(&self, name: &str) -> bool {
        self.pattern.matches(name) || self.bare.as_ref().is_some_and(|b| b.matches(name))
    }
}

/// Routes job names to pipeline options.
#[derive(Default)]
pub struct Dispatcher {
    routes: Vec<Route>,
}

impl Dispatcher {
    /// Build a dispatcher from `pattern -> options` pairs.
    pub fn new(routes: &HashMap<String, Options>) -> JobsResult<Self> {
        let mut out = Vec::with_capacity(routes.len());
        for (pattern, options) in routes {
            out.push(Route::new(pattern, options.clone())?);
        }
        // longest literal prefix first, ties resolved by pattern text for stable results
        out.sort_by(|a, b| {
            b.literal_len
                .cmp(&a.literal_len)
                .then_with(|| a.pattern.as_str().cmp(b.pattern.as_str()))
        });
        Ok(Self { routes: out })
    }

    /// Find the most specific route for `job`.
    pub fn match_job(&self, job: &str) -> Option<&Options> {
        let name = job.to_lowercase();
        self.routes
            .iter()
            .find(|r| r.matches(&name))
            .map(|r| &r.options)
    }

    /// Number of configured routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are configured.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
