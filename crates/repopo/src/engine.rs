//! The policy engine: walks the repository's tracked files and dispatches
//! matching policies, in parallel across files and sequentially within a
//! file so two policies never race on the same content.

use std::{sync::Arc, time::Instant};

use camino::{Utf8Path, Utf8PathBuf};
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    telemetry::{PolicyAction, PolicyTimings},
    FixResult, Handler, PolicyContext, PolicyError, PolicyFailure, PolicyInstance, PolicyOutcome,
    Resolver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Check,
    Fix,
}

/// Produces the repo-relative file set to evaluate. Defaults to
/// `git ls-files`; tests and embedders can inject their own.
pub type FileSource = Arc<dyn Fn(&Utf8Path) -> Result<Vec<String>, PolicyError> + Send + Sync>;

/// The default file source: the repository's tracked files.
pub fn git_ls_files(root: &Utf8Path) -> Result<Vec<String>, PolicyError> {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(root.as_str())
        .args(["ls-files", "-z"])
        .output()
        .map_err(|err| PolicyError::FileListing(err.to_string()))?;
    if !output.status.success() {
        return Err(PolicyError::FileListing(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .split('\0')
        .filter(|path| !path.is_empty())
        .map(str::to_owned)
        .collect())
}

#[derive(Debug, Default)]
pub struct PolicyRunReport {
    /// Violations left standing: everything in check mode, the unfixable
    /// remainder in fix mode.
    pub failures: Vec<PolicyFailure>,
    /// Fix attempts made in fix mode, resolved or not.
    pub fix_results: Vec<FixResult>,
    pub files_processed: usize,
    pub files_excluded: usize,
    pub files_total: usize,
    pub timings: Vec<(String, PolicyAction, std::time::Duration)>,
}

impl PolicyRunReport {
    /// Whether the run should exit zero.
    pub fn passed(&self) -> bool {
        self.failures.is_empty() && self.fix_results.iter().all(|fix| fix.resolved)
    }

    pub fn fixes_applied(&self) -> usize {
        self.fix_results.iter().filter(|fix| fix.resolved).count()
    }
}

pub struct PolicyEngine {
    root: Utf8PathBuf,
    mode: Mode,
    instances: Vec<PolicyInstance>,
    file_source: FileSource,
    concurrency: usize,
    telemetry: Option<Arc<PolicyTimings>>,
}

impl PolicyEngine {
    pub fn new(root: Utf8PathBuf, mode: Mode) -> Self {
        Self {
            root,
            mode,
            instances: Vec::new(),
            file_source: Arc::new(git_ls_files),
            concurrency: 8,
            telemetry: None,
        }
    }

    pub fn with_instances(mut self, instances: Vec<PolicyInstance>) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_file_source(mut self, source: FileSource) -> Self {
        self.file_source = source;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_telemetry(mut self) -> Self {
        self.telemetry = Some(Arc::new(PolicyTimings::default()));
        self
    }

    /// Evaluates every applicable (file, policy) pair. An internal policy
    /// error cancels the remaining work and propagates; policy *failures*
    /// are results, not errors.
    pub async fn run(self: Arc<Self>) -> Result<PolicyRunReport, PolicyError> {
        let files = (self.file_source)(&self.root)?;
        let files_total = files.len();
        let mut files_processed = 0;
        let mut files_excluded = 0;

        let scope = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut pending = FuturesUnordered::new();

        for repo_relative in files {
            let applicable: Vec<PolicyInstance> = self
                .instances
                .iter()
                .filter(|instance| instance.applies_to(&repo_relative))
                .cloned()
                .collect();
            if self
                .instances
                .iter()
                .any(|instance| instance.is_excluded(&repo_relative))
            {
                files_excluded += 1;
            }
            if applicable.is_empty() {
                continue;
            }
            files_processed += 1;

            let engine = self.clone();
            let semaphore = semaphore.clone();
            let scope = scope.clone();
            pending.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("policy semaphore is never closed");
                engine.evaluate_file(&repo_relative, &applicable, &scope).await
            }));
        }

        let mut failures = Vec::new();
        let mut fix_results = Vec::new();
        let mut first_error = None;
        while let Some(joined) = pending.next().await {
            let result = joined.unwrap_or_else(|err| {
                Err(PolicyError::Handler {
                    policy: "<engine>".to_owned(),
                    message: err.to_string(),
                })
            });
            match result {
                Ok(outcome) => {
                    failures.extend(outcome.failures);
                    fix_results.extend(outcome.fixes);
                }
                Err(err) => {
                    // An internal error cancels the siblings; keep draining
                    // so their cleanup runs before the error surfaces.
                    scope.cancel();
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        failures.sort_by(|a, b| (&a.file, &a.policy_name).cmp(&(&b.file, &b.policy_name)));
        fix_results.sort_by(|a, b| {
            (&a.failure.file, &a.failure.policy_name).cmp(&(&b.failure.file, &b.failure.policy_name))
        });

        Ok(PolicyRunReport {
            failures,
            fix_results,
            files_processed,
            files_excluded,
            files_total,
            timings: self
                .telemetry
                .as_ref()
                .map(|timings| timings.snapshot())
                .unwrap_or_default(),
        })
    }

    /// Policies for one file run sequentially to avoid content races while
    /// resolvers rewrite the file.
    async fn evaluate_file(
        &self,
        repo_relative: &str,
        instances: &[PolicyInstance],
        scope: &CancellationToken,
    ) -> Result<FileOutcome, PolicyError> {
        let mut outcome = FileOutcome::default();
        for instance in instances {
            if scope.is_cancelled() {
                return Err(PolicyError::Cancelled);
            }
            let context = PolicyContext {
                file: self.root.join(repo_relative),
                repo_relative: repo_relative.to_owned(),
                root: self.root.clone(),
                resolve: self.mode == Mode::Fix,
                config: instance.effective_config(),
            };

            match self.run_handler(instance, &context, scope).await? {
                PolicyOutcome::Passed => {}
                PolicyOutcome::Failure(failure) => {
                    self.handle_failure(instance, &context, failure, scope, &mut outcome)
                        .await?;
                }
            }
        }
        Ok(outcome)
    }

    async fn handle_failure(
        &self,
        instance: &PolicyInstance,
        context: &PolicyContext,
        failure: PolicyFailure,
        scope: &CancellationToken,
        outcome: &mut FileOutcome,
    ) -> Result<(), PolicyError> {
        let resolver = instance.policy().resolver.as_ref();
        if self.mode != Mode::Fix || !failure.auto_fixable || resolver.is_none() {
            outcome.failures.push(failure);
            return Ok(());
        }

        let repaired = self
            .run_resolver(instance, resolver.expect("checked above"), context, scope)
            .await?;
        let resolved = if repaired {
            // Re-check: a fix only counts when the handler passes afterwards.
            matches!(
                self.run_handler(instance, context, scope).await?,
                PolicyOutcome::Passed
            )
        } else {
            false
        };
        if !resolved {
            debug!(policy = instance.name(), file = %context.repo_relative, "fix failed");
        }
        outcome.fixes.push(FixResult { failure, resolved });
        Ok(())
    }

    async fn run_handler(
        &self,
        instance: &PolicyInstance,
        context: &PolicyContext,
        scope: &CancellationToken,
    ) -> Result<PolicyOutcome, PolicyError> {
        let started = Instant::now();
        let result = match &instance.policy().handler {
            Handler::Direct(handler) => handler(context),
            Handler::Cooperative(factory) => {
                let future = factory(context.clone(), scope.child_token());
                tokio::select! {
                    _ = scope.cancelled() => Err(PolicyError::Cancelled),
                    result = future => result,
                }
            }
        };
        if let Some(timings) = &self.telemetry {
            timings.record(instance.name(), PolicyAction::Handle, started.elapsed());
        }
        result
    }

    async fn run_resolver(
        &self,
        instance: &PolicyInstance,
        resolver: &Resolver,
        context: &PolicyContext,
        scope: &CancellationToken,
    ) -> Result<bool, PolicyError> {
        let started = Instant::now();
        let result = match resolver {
            Resolver::Direct(resolve) => resolve(context),
            Resolver::Cooperative(factory) => {
                let future = factory(context.clone(), scope.child_token());
                tokio::select! {
                    _ = scope.cancelled() => Err(PolicyError::Cancelled),
                    result = future => result,
                }
            }
        };
        if let Some(timings) = &self.telemetry {
            timings.record(instance.name(), PolicyAction::Resolve, started.elapsed());
        }
        result
    }
}

#[derive(Debug, Default)]
struct FileOutcome {
    failures: Vec<PolicyFailure>,
    fixes: Vec<FixResult>,
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use regex::Regex;

    use super::*;
    use crate::policies;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        files: Vec<String>,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let dir = tempfile::tempdir()?;
            let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
            Ok(Self {
                _dir: dir,
                root,
                files: Vec::new(),
            })
        }

        fn add(&mut self, rel: &str, contents: &str) -> Result<()> {
            let path = self.root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(path, contents)?;
            self.files.push(rel.to_owned());
            Ok(())
        }

        fn source(&self) -> FileSource {
            let files = self.files.clone();
            Arc::new(move |_root| Ok(files.clone()))
        }

        fn engine(&self, mode: Mode, instances: Vec<PolicyInstance>) -> Arc<PolicyEngine> {
            Arc::new(
                PolicyEngine::new(self.root.clone(), mode)
                    .with_instances(instances)
                    .with_file_source(self.source())
                    .with_telemetry(),
            )
        }
    }

    #[tokio::test]
    async fn test_check_reports_each_violating_file() -> Result<()> {
        let mut fixture = Fixture::new()?;
        fixture.add("a.md", "no trailing newline")?;
        fixture.add("b.md", "also bad")?;
        fixture.add("c.md", "fine\n")?;
        fixture.add("ignored.txt", "not matched")?;

        let engine = fixture.engine(
            Mode::Check,
            vec![PolicyInstance::new(policies::newline_at_eof())],
        );
        let report = engine.run().await?;

        assert!(!report.passed());
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.files_processed, 3);
        assert_eq!(report.files_total, 4);
        assert!(report.failures.iter().all(|f| f.auto_fixable));
        Ok(())
    }

    #[tokio::test]
    async fn test_fix_then_recheck_then_idempotent_fix() -> Result<()> {
        let mut fixture = Fixture::new()?;
        fixture.add("a.md", "one")?;
        fixture.add("b.md", "two")?;
        fixture.add("c.md", "three")?;

        let instances = || vec![PolicyInstance::new(policies::newline_at_eof())];

        // Three failures before the fix.
        let check = fixture.engine(Mode::Check, instances()).run().await?;
        assert_eq!(check.failures.len(), 3);

        // Fix repairs all three and re-checks each.
        let fix = fixture.engine(Mode::Fix, instances()).run().await?;
        assert!(fix.passed());
        assert_eq!(fix.fixes_applied(), 3);

        // The repository now passes a fresh check.
        let recheck = fixture.engine(Mode::Check, instances()).run().await?;
        assert!(recheck.passed());

        // A second fix run has nothing to do.
        let second_fix = fixture.engine(Mode::Fix, instances()).run().await?;
        assert_eq!(second_fix.fixes_applied(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_exclude_files_override() -> Result<()> {
        let mut fixture = Fixture::new()?;
        fixture.add("generated/out.md", "no newline")?;
        fixture.add("src/readme.md", "no newline")?;

        let instance = PolicyInstance::new(policies::newline_at_eof())
            .with_exclude_files(vec![Regex::new("^generated/").unwrap()]);
        let report = fixture.engine(Mode::Check, vec![instance]).run().await?;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].file, "src/readme.md");
        assert_eq!(report.files_excluded, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cooperative_handler_flags_mismatched_package_name() -> Result<()> {
        let mut fixture = Fixture::new()?;
        fixture.add("packages/alpha/package.json", r#"{ "name": "alpha" }"#)?;
        fixture.add("packages/beta/package.json", r#"{ "name": "wrong" }"#)?;

        let engine = fixture.engine(
            Mode::Check,
            vec![PolicyInstance::new(policies::package_name_matches_dir())],
        );
        let report = engine.run().await?;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].file, "packages/beta/package.json");
        assert!(!report.failures[0].auto_fixable);
        Ok(())
    }

    #[tokio::test]
    async fn test_internal_error_cancels_the_run() -> Result<()> {
        let mut fixture = Fixture::new()?;
        for i in 0..20 {
            fixture.add(&format!("file{i}.md"), "content\n")?;
        }

        let broken = crate::Policy {
            name: "broken".into(),
            description: "always errors".into(),
            match_pattern: Regex::new(r"\.md$").unwrap(),
            handler: Handler::Direct(Arc::new(|_ctx| {
                Err(PolicyError::Handler {
                    policy: "broken".into(),
                    message: "boom".into(),
                })
            })),
            resolver: None,
            default_config: None,
        };
        let engine = fixture
            .engine(Mode::Check, vec![PolicyInstance::new(broken)]);
        let err = engine.run().await.unwrap_err();
        assert!(
            matches!(err, PolicyError::Handler { .. } | PolicyError::Cancelled),
            "{err:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_telemetry_records_handle_and_resolve() -> Result<()> {
        let mut fixture = Fixture::new()?;
        fixture.add("a.md", "needs fixing")?;

        let engine = fixture.engine(
            Mode::Fix,
            vec![PolicyInstance::new(policies::newline_at_eof())],
        );
        let report = engine.run().await?;
        assert!(report.passed());

        let actions: Vec<PolicyAction> =
            report.timings.iter().map(|(_, action, _)| *action).collect();
        assert!(actions.contains(&PolicyAction::Handle));
        assert!(actions.contains(&PolicyAction::Resolve));
        Ok(())
    }
}
