use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::copier::{Copier, FileCopier};
use super::copy_task::CopyTask;
use super::escalation::EscalationPlan;
use super::registry::TaskRegistry;
use super::TaskState;
use crate::error::{Result, SupervisorError};
use crate::utils::bounded_path::{BoundedPath, DirPrefix};
use crate::utils::config::Config;

/// Default maximum number of concurrently running copy tasks.
pub const DEFAULT_MAX_TASKS: usize = 8;

/// Running-task counter and the ceiling it is gated on.
///
/// The ceiling only gates new starts; lowering it never stops running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunGauge {
    running: usize,
    ceiling: usize,
}

impl RunGauge {
    pub fn new(ceiling: usize) -> Self {
        Self {
            running: 0,
            ceiling,
        }
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn has_room(&self) -> bool {
        self.running < self.ceiling
    }

    pub(crate) fn acquire(&mut self) {
        self.running += 1;
    }

    pub(crate) fn release(&mut self) {
        match self.running.checked_sub(1) {
            Some(n) => self.running = n,
            None => error!("running task counter underflow"),
        }
    }
}

/// Point-in-time summary for logs.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Snapshot {
    pub tasks: usize,
    pub running: usize,
    pub idle: usize,
    pub ceiling: usize,
}

/// Reconciles copy jobs against a bounded pool of children.
///
/// Owns the task registry and the running counter. Not thread-safe: one
/// caller drives `reconcile()` and `tick()`.
pub struct Scheduler {
    registry: TaskRegistry<CopyTask>,
    gauge: RunGauge,
    plan: EscalationPlan,
    copier: Box<dyn Copier>,
}

impl Scheduler {
    pub fn new(ceiling: usize) -> Self {
        Self {
            registry: TaskRegistry::new(),
            gauge: RunGauge::new(ceiling),
            plan: EscalationPlan::default(),
            copier: Box::new(FileCopier),
        }
    }

    /// Build a scheduler from the supervisor configuration.
    pub fn init(config: &Config) -> Self {
        info!(
            "Scheduler ready: up to {} concurrent copies, {:?} stop grace",
            config.max_tasks, config.stop_grace
        );
        Self::new(config.max_tasks).with_escalation(EscalationPlan::standard(config.stop_grace))
    }

    pub fn with_copier(mut self, copier: impl Copier + 'static) -> Self {
        self.copier = Box::new(copier);
        self
    }

    pub fn with_escalation(mut self, plan: EscalationPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn set_concurrency_ceiling(&mut self, ceiling: usize) {
        info!("Concurrency ceiling {} -> {}", self.gauge.ceiling, ceiling);
        self.gauge.ceiling = ceiling;
    }

    pub fn ceiling(&self) -> usize {
        self.gauge.ceiling()
    }

    pub fn task_count(&self) -> usize {
        self.registry.len()
    }

    pub fn running_count(&self) -> usize {
        self.gauge.running()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &CopyTask> {
        self.registry.iter()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tasks: self.registry.len(),
            running: self.gauge.running(),
            idle: self
                .registry
                .iter()
                .filter(|t| t.state() == TaskState::Idle)
                .count(),
            ceiling: self.gauge.ceiling(),
        }
    }

    /// First task at or after `start` copying `source` and / or to
    /// `destination`.
    pub fn find(
        &self,
        start: usize,
        source: Option<&Path>,
        destination: Option<&Path>,
    ) -> Option<usize> {
        self.registry
            .find_from(start, |task| task.matches(source, destination))
    }

    /// Register a new copy task and return its slot.
    pub fn create_task(&mut self, source: BoundedPath, destination: BoundedPath) -> Result<usize> {
        let task = CopyTask::new(source, destination)?;
        let index = self.registry.add(task)?;
        debug!(
            "{} jobs, {} running",
            self.registry.len(),
            self.gauge.running()
        );
        Ok(index)
    }

    /// Stop the task at `index` if it still has a child, then drop it.
    pub fn delete_task(&mut self, index: usize) -> Result<()> {
        let task = self
            .registry
            .get_mut(index)
            .ok_or(SupervisorError::Inconsistent { index })?;
        if task.pid().is_some() {
            if let Err(e) = task.stop(&mut self.gauge, &self.plan) {
                warn!("{} -> {}: {}", task.source().display(), task.destination().display(), e);
            }
        }

        let task = self.registry.remove(index)?;
        debug!(
            "removed {} -> {}; {} jobs, {} running",
            task.source().display(),
            task.destination().display(),
            self.registry.len(),
            self.gauge.running()
        );
        Ok(())
    }

    /// Create tasks for every listed file whose destination is missing or
    /// differs in size or modification time from the source.
    ///
    /// `file_list` holds one bare file name per line, as raw bytes. Malformed
    /// entries are skipped; only directories too long to hold any file name
    /// fail the call. Returns the number of tasks created.
    pub fn reconcile(
        &mut self,
        source_dir: &Path,
        dest_dir: &Path,
        file_list: impl AsRef<[u8]>,
    ) -> Result<usize> {
        let source_prefix = DirPrefix::new(source_dir)?;
        let dest_prefix = DirPrefix::new(dest_dir)?;
        let budget = source_prefix.name_budget().min(dest_prefix.name_budget());

        let mut created = 0;
        for entry in file_list.as_ref().split(|&b| b == b'\n') {
            if entry.is_empty() {
                continue;
            }
            let name = Path::new(OsStr::from_bytes(entry)).display();
            if entry.len() > budget {
                warn!(target: "user", "file name too long, ignoring: {}", name);
                continue;
            }
            // the copier does not create directories
            if entry == b"." || entry == b".." || entry.contains(&b'/') || entry.contains(&0) {
                debug!("ignoring {}", name);
                continue;
            }

            let (source, destination) = match (source_prefix.join(entry), dest_prefix.join(entry)) {
                (Ok(s), Ok(d)) => (s, d),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("ignoring {}: {}", name, e);
                    continue;
                }
            };

            if self
                .find(0, Some(source.as_path()), Some(destination.as_path()))
                .is_some()
            {
                continue;
            }
            if is_up_to_date(source.as_path(), destination.as_path()) {
                continue;
            }

            match self.create_task(source, destination) {
                Ok(_) => created += 1,
                Err(e) => warn!("cannot copy {}: {}", name, e),
            }
        }
        Ok(created)
    }

    /// One pass over all tasks: start idle ones while under the ceiling,
    /// poll, and drop those that finished.
    pub fn tick(&mut self) -> Result<()> {
        let mut i = 0;
        while let Some(task) = self.registry.get_mut(i) {
            if task.state() == TaskState::Idle && self.gauge.has_room() {
                if let Err(e) = task.start(&mut self.gauge, self.copier.as_ref()) {
                    error!("{} -> {}: {}", task.source().display(), task.destination().display(), e);
                }
            }
            if let Err(e) = task.poll(&mut self.gauge) {
                warn!("{} -> {}: {}", task.source().display(), task.destination().display(), e);
            }

            let state = task.state();
            if !state.is_terminal() {
                i += 1;
                continue;
            }
            match state {
                TaskState::Stopped => info!(
                    "copied {} to {}",
                    task.source().display(),
                    task.destination().display()
                ),
                _ => warn!(
                    "copy of {} to {} ended {}",
                    task.source().display(),
                    task.destination().display(),
                    state
                ),
            }
            if let Err(e) = self.delete_task(i) {
                error!("{}", e);
                i += 1;
            }
        }

        debug!("{} jobs, {} running", self.registry.len(), self.gauge.running());
        Ok(())
    }

    /// Stop every child and empty the registry.
    pub fn shutdown(&mut self) {
        info!(
            "Shutting down: {} jobs, {} running",
            self.registry.len(),
            self.gauge.running()
        );
        while let Some(last) = self.registry.len().checked_sub(1) {
            if let Err(e) = self.delete_task(last) {
                error!("{}", e);
                break;
            }
        }
    }
}

/// Whether `destination` already matches `source` in size and mtime.
///
/// Modification times are compared in whole seconds; destinations on
/// filesystems with coarser timestamps would otherwise never match.
fn is_up_to_date(source: &Path, destination: &Path) -> bool {
    let (Ok(src), Ok(dst)) = (std::fs::metadata(source), std::fs::metadata(destination)) else {
        return false;
    };
    src.len() == dst.len() && src.mtime() == dst.mtime()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bounded_path::MAX_PATH_LEN;
    use std::fs::{self, File};
    use std::io;
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Dirs {
        _root: TempDir,
        src: PathBuf,
        dst: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("a");
        let dst = root.path().join("b");
        fs::create_dir(&src).unwrap();
        fs::create_dir(&dst).unwrap();
        Dirs {
            _root: root,
            src,
            dst,
        }
    }

    fn write_with_mtime(path: &Path, data: &[u8], mtime: SystemTime) {
        fs::write(path, data).unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    fn epoch(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    /// Copier whose children hang until they are stopped.
    struct HangingCopier;

    impl Copier for HangingCopier {
        fn copy(&self, _: &Path, _: &Path) -> io::Result<()> {
            thread::sleep(Duration::from_secs(60));
            Ok(())
        }
    }

    fn running_tasks(s: &Scheduler) -> usize {
        s.tasks().filter(|t| t.state() == TaskState::Running).count()
    }

    #[test]
    fn creates_task_only_for_stale_files() {
        let d = dirs();
        fs::write(d.src.join("x"), b"new").unwrap();
        write_with_mtime(&d.src.join("y"), b"same", epoch(1_600_000_000));
        write_with_mtime(&d.dst.join("y"), b"same", epoch(1_600_000_000));

        let mut s = Scheduler::new(DEFAULT_MAX_TASKS);
        let created = s.reconcile(&d.src, &d.dst, "x\ny\n").unwrap();

        assert_eq!(created, 1);
        assert_eq!(s.task_count(), 1);
        let task = s.tasks().next().unwrap();
        assert_eq!(task.source(), d.src.join("x"));
        assert_eq!(task.destination(), d.dst.join("x"));
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[test]
    fn duplicate_pairs_are_suppressed() {
        let d = dirs();
        fs::write(d.src.join("x"), b"data").unwrap();

        let mut s = Scheduler::new(DEFAULT_MAX_TASKS);
        assert_eq!(s.reconcile(&d.src, &d.dst, "x\n").unwrap(), 1);
        assert_eq!(s.reconcile(&d.src, &d.dst, "x\nx\n").unwrap(), 0);
        assert_eq!(s.task_count(), 1);
        assert_eq!(
            s.find(
                0,
                Some(d.src.join("x").as_path()),
                Some(d.dst.join("x").as_path())
            ),
            Some(0)
        );
        assert_eq!(s.find(1, Some(d.src.join("x").as_path()), None), None);
    }

    #[test]
    fn size_or_mtime_change_makes_a_task() {
        let d = dirs();
        write_with_mtime(&d.src.join("sized"), b"longer", epoch(1_600_000_000));
        write_with_mtime(&d.dst.join("sized"), b"short", epoch(1_600_000_000));
        write_with_mtime(&d.src.join("touched"), b"same", epoch(1_600_000_100));
        write_with_mtime(&d.dst.join("touched"), b"same", epoch(1_600_000_000));

        let mut s = Scheduler::new(DEFAULT_MAX_TASKS);
        assert_eq!(s.reconcile(&d.src, &d.dst, "sized").unwrap(), 1);
        assert_eq!(s.reconcile(&d.src, &d.dst, "touched").unwrap(), 1);
        assert_eq!(s.task_count(), 2);
    }

    #[test]
    fn subsecond_mtime_difference_is_up_to_date() {
        let d = dirs();
        let base = epoch(1_600_000_000);
        write_with_mtime(&d.src.join("y"), b"same", base + Duration::from_millis(500));
        write_with_mtime(&d.dst.join("y"), b"same", base);

        let mut s = Scheduler::new(DEFAULT_MAX_TASKS);
        assert_eq!(s.reconcile(&d.src, &d.dst, "y\n").unwrap(), 0);
        assert_eq!(s.task_count(), 0);
    }

    #[test]
    fn non_utf8_names_do_not_spoil_the_list() {
        let d = dirs();
        let odd = OsStr::from_bytes(b"\xffodd");
        fs::write(d.src.join(odd), b"data").unwrap();
        fs::write(d.src.join("plain"), b"data").unwrap();

        let mut s = Scheduler::new(DEFAULT_MAX_TASKS);
        let created = s.reconcile(&d.src, &d.dst, b"\xffodd\nplain\n").unwrap();

        assert_eq!(created, 2);
        assert!(s.find(0, Some(d.src.join(odd).as_path()), None).is_some());
        assert!(s.find(0, Some(d.src.join("plain").as_path()), None).is_some());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let d = dirs();
        fs::create_dir(d.src.join("sub")).unwrap();
        fs::write(d.src.join("sub").join("x"), b"data").unwrap();
        let long = "l".repeat(MAX_PATH_LEN);
        let list = format!("sub/x\n\n.\n..\n{long}\nmissing\n");

        let mut s = Scheduler::new(DEFAULT_MAX_TASKS);
        assert_eq!(s.reconcile(&d.src, &d.dst, &list).unwrap(), 0);
        assert_eq!(s.task_count(), 0);
    }

    #[test]
    fn oversized_directory_fails_whole_call() {
        let d = dirs();
        let huge = PathBuf::from(format!("/{}", "d".repeat(MAX_PATH_LEN)));

        let mut s = Scheduler::new(DEFAULT_MAX_TASKS);
        assert!(matches!(
            s.reconcile(&huge, &d.dst, "x\n"),
            Err(SupervisorError::PathTooLong { .. })
        ));
    }

    #[test]
    fn tasks_run_as_file_owner() {
        let d = dirs();
        fs::write(d.src.join("x"), b"data").unwrap();

        let mut s = Scheduler::new(DEFAULT_MAX_TASKS);
        s.reconcile(&d.src, &d.dst, "x").unwrap();

        use std::os::unix::fs::MetadataExt;
        let meta = fs::symlink_metadata(d.src.join("x")).unwrap();
        let task = s.tasks().next().unwrap();
        assert_eq!(task.uid().as_raw(), meta.uid());
        assert_eq!(task.gid().as_raw(), meta.gid());
    }

    #[test]
    fn tick_respects_ceiling() {
        let d = dirs();
        let names: Vec<String> = (0..5).map(|i| format!("f{i}")).collect();
        for name in &names {
            fs::write(d.src.join(name), b"data").unwrap();
        }

        let mut s = Scheduler::new(2).with_copier(HangingCopier);
        s.reconcile(&d.src, &d.dst, &names.join("\n")).unwrap();
        assert_eq!(s.task_count(), 5);

        s.tick().unwrap();
        assert_eq!(s.running_count(), 2);
        assert_eq!(running_tasks(&s), 2);
        assert_eq!(s.snapshot().idle, 3);

        s.tick().unwrap();
        assert_eq!(s.running_count(), 2);

        s.set_concurrency_ceiling(3);
        s.tick().unwrap();
        assert_eq!(s.running_count(), 3);
        assert_eq!(running_tasks(&s), 3);

        s.shutdown();
        assert_eq!(s.task_count(), 0);
        assert_eq!(s.running_count(), 0);
    }

    #[test]
    fn ticks_copy_files_and_drain_registry() {
        let d = dirs();
        let names: Vec<String> = (0..6).map(|i| format!("f{i}")).collect();
        for name in &names {
            fs::write(d.src.join(name), name.as_bytes()).unwrap();
        }

        let mut s = Scheduler::new(3);
        s.reconcile(&d.src, &d.dst, &names.join("\n")).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while s.task_count() > 0 {
            assert!(std::time::Instant::now() < deadline, "copies never finished");
            s.tick().unwrap();
            assert_eq!(s.running_count(), running_tasks(&s));
            assert!(s.running_count() <= 3);
            thread::sleep(Duration::from_millis(5));
        }

        for name in &names {
            assert_eq!(fs::read(d.dst.join(name)).unwrap(), name.as_bytes());
        }
        // finished copies carry the source mtime, so nothing is stale
        assert_eq!(s.reconcile(&d.src, &d.dst, &names.join("\n")).unwrap(), 0);
    }

    #[test]
    fn failed_copy_is_dropped() {
        let d = dirs();
        fs::write(d.src.join("x"), b"data").unwrap();
        let missing = d.dst.join("no-such-dir");

        let mut s = Scheduler::new(1);
        s.reconcile(&d.src, &missing, "x").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while s.task_count() > 0 {
            assert!(std::time::Instant::now() < deadline);
            s.tick().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(s.running_count(), 0);
        assert!(!missing.exists());
    }

    #[test]
    fn delete_of_unknown_slot_is_inconsistent() {
        let mut s = Scheduler::new(1);
        assert!(matches!(
            s.delete_task(0),
            Err(SupervisorError::Inconsistent { index: 0 })
        ));
    }

    #[test]
    fn gauge_counts() {
        let mut g = RunGauge::new(1);
        assert!(g.has_room());
        g.acquire();
        assert!(!g.has_room());
        g.release();
        g.release();
        assert_eq!(g.running(), 0);
    }
}
