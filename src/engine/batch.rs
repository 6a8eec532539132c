//! Distributed execution through an external job scheduler.
//!
//! Nodes backed by a command line are written out as a small shell script
//! in their working directory and handed to a [`Submitter`]. The scheduler
//! thread keeps polling the submitted jobs and finishes each node once its
//! job is done, reading the exit status and captured streams back from the
//! working directory. Everything else runs locally on the scheduler thread.

use std::collections::HashMap;
use std::fs;
use std::process::{Child, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use camino::Utf8Path;
use petgraph::stable_graph::NodeIndex;

use crate::engine::{Backend, Frontier, NodeExecution, Plan, RunReport};
use crate::error::{NodeError, RunError};
use crate::interface::Runtime;
use crate::node::{Env, Job, Node, Outcome, Prepared};
use crate::utils::hostname;

pub(crate) const SCRIPT_FILE: &str = "batch.sh";
const STDOUT_FILE: &str = "batch.stdout";
const STDERR_FILE: &str = "batch.stderr";
const EXITCODE_FILE: &str = "batch.exitcode";

/// State of a submitted job as seen by its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    /// The job left the scheduler, successfully or not.
    Done,
}

/// Hands scripts over to a job scheduler.
pub trait Submitter: Send + Sync {
    /// Submits `script`, to be run in `dir`, returning a job id.
    fn submit(&self, script: &Utf8Path, dir: &Utf8Path) -> anyhow::Result<String>;

    fn status(&self, job: &str) -> anyhow::Result<JobStatus>;

    fn cancel(&self, job: &str) -> anyhow::Result<()>;
}

/// Runs submitted scripts as local `sh` processes.
#[derive(Debug, Default)]
pub struct Shell {
    children: Mutex<HashMap<String, Child>>,
}

impl Shell {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Submitter for Shell {
    fn submit(&self, script: &Utf8Path, dir: &Utf8Path) -> anyhow::Result<String> {
        let mut command = std::process::Command::new("sh");
        command
            .arg(script)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // sh leads a process group of its own, so cancelling reaches whatever
        // the script started
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let child = command
            .spawn()
            .with_context(|| format!("couldn't start sh for {script}"))?;

        let id = child.id().to_string();
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        children.insert(id.clone(), child);
        Ok(id)
    }

    fn status(&self, job: &str) -> anyhow::Result<JobStatus> {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(child) = children.get_mut(job) else {
            return Ok(JobStatus::Done);
        };
        match child.try_wait()? {
            Some(_) => {
                children.remove(job);
                Ok(JobStatus::Done)
            }
            None => Ok(JobStatus::Running),
        }
    }

    fn cancel(&self, job: &str) -> anyhow::Result<()> {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut child) = children.remove(job) {
            #[cfg(unix)]
            {
                let status = std::process::Command::new("kill")
                    .args(["-KILL", "--", &format!("-{job}")])
                    .stderr(Stdio::null())
                    .status()
                    .context("couldn't run kill")?;
                if !status.success() {
                    tracing::debug!("process group {job} was already gone");
                }
            }
            child.kill()?;
            child.wait()?;
        }
        Ok(())
    }
}

/// Submits command-line nodes to a job scheduler and polls them until they
/// are done.
#[derive(Debug)]
pub struct Batch<S> {
    submitter: S,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl<S: Submitter> Batch<S> {
    pub fn new(submitter: S) -> Self {
        Self {
            submitter,
            poll_interval: Duration::from_millis(500),
            timeout: None,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Cancels jobs running longer than `timeout` and fails their nodes.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A job handed to the submitter and not yet done.
struct Submitted<'n> {
    index: NodeIndex,
    job: Job<'n>,
    id: String,
    command: String,
    start: Instant,
}

fn script(dir: &Utf8Path, command: &str) -> String {
    format!(
        "#!/bin/sh\ncd '{}' || exit 1\n{command} > {STDOUT_FILE} 2> {STDERR_FILE}\necho $? > {EXITCODE_FILE}\n",
        dir.as_str().replace('\'', r"'\''"),
    )
}

/// Reads back what the job script left in the working directory.
fn collect(dir: &Utf8Path, command: String, elapsed: Duration) -> Result<Runtime, NodeError> {
    let code = fs::read_to_string(dir.join(EXITCODE_FILE))
        .ok()
        .and_then(|text| text.trim().parse::<i32>().ok())
        .ok_or_else(|| NodeError::Submit(anyhow::anyhow!("job finished without leaving an exit status in {dir}")))?;

    Ok(Runtime {
        hostname: hostname(),
        duration: elapsed,
        returncode: Some(code),
        stdout: fs::read_to_string(dir.join(STDOUT_FILE)).ok(),
        stderr: fs::read_to_string(dir.join(STDERR_FILE)).ok(),
        command: Some(command),
        ..Runtime::default()
    })
}

enum Dispatched<'n> {
    Finished(Result<Outcome, NodeError>),
    Submitted(Submitted<'n>),
}

impl<S: Submitter> Batch<S> {
    /// Prepares a node and submits its command line. Cache hits and nodes
    /// without a command line finish right here.
    fn dispatch<'n>(&self, env: &Env<'_>, index: NodeIndex, node: &'n Node) -> Dispatched<'n> {
        let prepared = node
            .resolve_inputs(env)
            .and_then(|inputs| node.prepare(env, node.output_dir.clone(), inputs));
        let job = match prepared {
            Ok(Prepared::Ready(job)) => job,
            Ok(Prepared::Cached(outcome)) => return Dispatched::Finished(Ok(outcome)),
            Err(error) => return Dispatched::Finished(Err(error)),
        };

        let Some(command) = job.command_line() else {
            let runtime = job.execute(env);
            return Dispatched::Finished(job.finish(env, runtime));
        };

        let path = job.dir.join(SCRIPT_FILE);
        let submitted = fs::write(&path, script(&job.dir, &command))
            .map_err(NodeError::from)
            .and_then(|()| {
                self.submitter
                    .submit(&path, &job.dir)
                    .map_err(NodeError::Submit)
            });

        match submitted {
            Ok(id) => {
                tracing::info!("submitted {} as job {id}", node.fullname());
                Dispatched::Submitted(Submitted {
                    index,
                    job,
                    id,
                    command,
                    start: Instant::now(),
                })
            }
            Err(error) => Dispatched::Finished(job.finish(env, Err(error))),
        }
    }
}

impl<S: Submitter> Backend for Batch<S> {
    fn name(&self) -> &str {
        "batch"
    }

    fn run(&self, plan: &Plan<'_>) -> Result<RunReport, RunError> {
        let mut frontier = Frontier::new(plan, self.name());
        let span = frontier.span();
        let _enter = span.enter();
        let env = plan.env();
        let mut inflight: Vec<Submitted<'_>> = Vec::new();

        loop {
            while let Some(index) = frontier.pop() {
                let node = plan.node(index);
                let start = Instant::now();

                // map nodes fan out in-process
                let outcome = if node.is_map() {
                    node.run(&env)
                } else {
                    match self.dispatch(&env, index, node) {
                        Dispatched::Finished(outcome) => outcome,
                        Dispatched::Submitted(submitted) => {
                            inflight.push(submitted);
                            continue;
                        }
                    }
                };

                let execution = NodeExecution {
                    start,
                    duration: start.elapsed(),
                };
                frontier.settle(index, outcome, execution);
            }

            if inflight.is_empty() {
                break;
            }

            let mut progressed = false;
            let mut waiting = Vec::with_capacity(inflight.len());
            for submitted in inflight.drain(..) {
                let elapsed = submitted.start.elapsed();
                let status = self.submitter.status(&submitted.id);

                let runtime = match status {
                    Ok(JobStatus::Done) => collect(&submitted.job.dir, submitted.command.clone(), elapsed),
                    Ok(_) if self.timeout.is_some_and(|limit| elapsed > limit) => {
                        if let Err(e) = self.submitter.cancel(&submitted.id) {
                            tracing::warn!("couldn't cancel job {}: {e:#}", submitted.id);
                        }
                        Err(NodeError::Timeout(elapsed))
                    }
                    Ok(_) => {
                        waiting.push(submitted);
                        continue;
                    }
                    Err(error) => Err(NodeError::Submit(error)),
                };

                progressed = true;
                let Submitted { index, job, start, .. } = submitted;
                let outcome = job.finish(&env, runtime);
                frontier.settle(index, outcome, NodeExecution { start, duration: elapsed });
            }
            inflight = waiting;

            if !progressed {
                std::thread::sleep(self.poll_interval);
            }
        }

        Ok(frontier.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_quotes_directory() {
        let text = script(Utf8Path::new("/tmp/it's"), "echo hi");
        assert!(text.starts_with("#!/bin/sh\n"));
        assert!(text.contains(r"cd '/tmp/it'\''s' || exit 1"));
        assert!(text.contains("echo hi > batch.stdout 2> batch.stderr"));
        assert!(text.ends_with("echo $? > batch.exitcode\n"));
    }

    #[test]
    fn test_collect_requires_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            collect(&root, "true".into(), Duration::ZERO),
            Err(NodeError::Submit(_))
        ));

        fs::write(root.join(EXITCODE_FILE), "3\n").unwrap();
        fs::write(root.join(STDOUT_FILE), "out").unwrap();
        let runtime = collect(&root, "true".into(), Duration::ZERO).unwrap();
        assert_eq!(runtime.returncode, Some(3));
        assert_eq!(runtime.stdout.as_deref(), Some("out"));
        assert_eq!(runtime.stderr, None);
    }

    #[test]
    fn test_shell_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let path = root.join(SCRIPT_FILE);
        fs::write(&path, script(&root, "echo hello")).unwrap();

        let shell = Shell::new();
        let id = shell.submit(&path, &root).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while shell.status(&id).unwrap() != JobStatus::Done {
            assert!(Instant::now() < deadline, "job never finished");
            std::thread::sleep(Duration::from_millis(10));
        }

        let runtime = collect(&root, "echo hello".into(), Duration::ZERO).unwrap();
        assert_eq!(runtime.returncode, Some(0));
        assert_eq!(runtime.stdout.as_deref(), Some("hello\n"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_shell_cancel_kills_the_whole_script() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let path = root.join(SCRIPT_FILE);
        fs::write(&path, "sleep 30 &\necho $! > sleeper.pid\nwait\n").unwrap();

        let shell = Shell::new();
        let id = shell.submit(&path, &root).unwrap();

        let pidfile = root.join("sleeper.pid");
        let deadline = Instant::now() + Duration::from_secs(10);
        let pid = loop {
            if let Ok(text) = fs::read_to_string(&pidfile)
                && let Ok(pid) = text.trim().parse::<u32>()
            {
                break pid;
            }
            assert!(Instant::now() < deadline, "script never started its child");
            std::thread::sleep(Duration::from_millis(10));
        };

        shell.cancel(&id).unwrap();
        assert_eq!(shell.status(&id).unwrap(), JobStatus::Done);

        // the orphaned sleep may linger as a zombie until it is reaped
        let alive = || {
            fs::read_to_string(format!("/proc/{pid}/stat"))
                .map(|stat| !stat.contains(") Z "))
                .unwrap_or(false)
        };
        let deadline = Instant::now() + Duration::from_secs(10);
        while alive() {
            assert!(Instant::now() < deadline, "sleep outlived its cancelled script");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
