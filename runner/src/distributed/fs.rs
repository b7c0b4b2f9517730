use super::{
    util::{env_usize, round_robin, RANK_VARIABLES, SIZE_VARIABLES},
    DistributionError, Runtime,
};
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    env,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info, instrument, trace};

/// prefix of a file while it is still being written
pub const PROCESSING_PREFIX: &str = "[processing]_";

const ANNOUNCEMENT: &str = "run.json";
const WELCOME: &str = "welcome.json";

/// Runtime for a fixed set of nodes that share a folder.
///
/// Before the first round the nodes agree on a run: the master announces a
/// fresh run id in `<session>/run.json`, every other node answers in
/// `<session>/hello/<rank>.json` with that id and a nonce of its own, and the
/// master lists the nonces in `<session>/<run>/welcome.json`. A node only
/// accepts a welcome carrying its own nonce, so files left behind by an earlier
/// run in the same session are never read.
///
/// Each `reduce` is one round: every node publishes its list as
/// `<session>/<run>/round-<k>/<rank>.json` (written under the processing prefix
/// and renamed, so readers never see a partial file), waits until all nodes
/// published, and concatenates the lists in rank order. Rounds are counted per
/// node, so all nodes must call `reduce` the same number of times. A session
/// hosts one run at a time.
#[derive(Debug)]
pub struct FsRuntime {
    session: PathBuf,
    rank: usize,
    nodes: usize,
    poll: Duration,
    timeout: Option<Duration>,
    round: AtomicUsize,
    run: Mutex<Option<PathBuf>>,
}

#[derive(Serialize, Deserialize, Debug)]
struct Announcement {
    run: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct Hello {
    run: String,
    nonce: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct Welcome {
    // nonce of every node by rank
    nonces: Vec<String>,
}

impl FsRuntime {
    pub fn new(
        path: impl AsRef<Path>,
        session: &str,
        rank: usize,
        nodes: usize,
    ) -> Result<Self, DistributionError> {
        if nodes == 0 || rank >= nodes {
            return Err(DistributionError::Topology { rank, nodes });
        }

        let session = path.as_ref().join(session);
        fs::create_dir_all(&session)?;
        info!(folder = ?session, rank, nodes, "Joined shared folder runtime");

        Ok(Self {
            session,
            rank,
            nodes,
            poll: Duration::from_millis(500),
            timeout: None,
            round: AtomicUsize::new(0),
            run: Mutex::new(None),
        })
    }

    /// fill missing rank, node count and session from the launcher environment
    pub fn load(
        path: impl AsRef<Path>,
        rank: Option<usize>,
        nodes: Option<usize>,
        session: Option<String>,
    ) -> Result<Self, DistributionError> {
        let rank = rank
            .or_else(|| env_usize(&RANK_VARIABLES))
            .ok_or(DistributionError::MissingTopology("rank"))?;
        let nodes = nodes
            .or_else(|| env_usize(&SIZE_VARIABLES))
            .ok_or(DistributionError::MissingTopology("node count"))?;
        let session = session
            .or_else(|| env::var("SLURM_JOB_ID").ok())
            .unwrap_or_else(|| String::from("default"));

        Self::new(path, &session, rank, nodes)
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// folder of the current run, agreed on with the other nodes on first use
    pub fn run_folder(&self) -> Result<PathBuf, DistributionError> {
        let mut run = self.run.lock();
        if let Some(folder) = run.as_ref() {
            return Ok(folder.clone());
        }

        let folder = if self.rank == 0 {
            self.announce()?
        } else {
            self.join()?
        };
        *run = Some(folder.clone());

        Ok(folder)
    }

    fn announce(&self) -> Result<PathBuf, DistributionError> {
        let run = nonce(self.rank);
        let folder = self.session.join(&run);
        fs::create_dir_all(&folder)?;
        write_json(&self.session, ANNOUNCEMENT, &Announcement { run: run.clone() })?;
        info!(run = %run, "Announced run");

        let start = Instant::now();
        let nonces = loop {
            let mut nonces = vec![String::new()];
            let mut missing = Vec::new();

            for node in 1..self.nodes {
                match read_json::<Hello>(&node_file(&self.hello_folder(), node))? {
                    Some(hello) if hello.run == run => nonces.push(hello.nonce),
                    _ => missing.push(node),
                }
            }

            if missing.is_empty() {
                break nonces;
            }
            self.pause(start, missing)?;
        };

        write_json(&folder, WELCOME, &Welcome { nonces })?;
        debug!("All {} nodes joined", self.nodes);

        Ok(folder)
    }

    fn join(&self) -> Result<PathBuf, DistributionError> {
        let nonce = nonce(self.rank);
        let mut answered: Option<String> = None;
        let start = Instant::now();

        loop {
            if let Some(Announcement { run }) = read_json(&self.session.join(ANNOUNCEMENT))? {
                let folder = self.session.join(&run);

                // the announcement may be stale, answer again whenever it changes
                if answered.as_ref() != Some(&run) {
                    write_json(
                        &self.hello_folder(),
                        &format!("{}.json", self.rank),
                        &Hello {
                            run: run.clone(),
                            nonce: nonce.clone(),
                        },
                    )?;
                    trace!(run = %run, "Answered announcement");
                    answered = Some(run.clone());
                }

                if let Some(welcome) = read_json::<Welcome>(&folder.join(WELCOME))? {
                    if welcome.nonces.get(self.rank) == Some(&nonce) {
                        info!(run = %run, "Joined run");
                        return Ok(folder);
                    }
                }
            }

            self.pause(start, vec![0])?;
        }
    }

    fn hello_folder(&self) -> PathBuf {
        self.session.join("hello")
    }

    /// sleep one poll interval, or fail once the join timeout is exceeded
    fn pause(&self, start: Instant, missing: Vec<usize>) -> Result<(), DistributionError> {
        let waited = start.elapsed();
        if let Some(timeout) = self.timeout {
            if waited >= timeout {
                return Err(DistributionError::JoinTimeout { missing, waited });
            }
        }

        trace!(missing = ?missing, "Waiting for nodes to join");
        thread::sleep(self.poll);
        Ok(())
    }

    fn publish<T: Serialize>(&self, folder: &Path, items: &[T]) -> Result<(), DistributionError> {
        let target = write_json(folder, &format!("{}.json", self.rank), items)?;
        debug!(path = ?target, "Published node results");
        Ok(())
    }

    fn wait(&self, folder: &Path, round: usize) -> Result<(), DistributionError> {
        let start = Instant::now();

        loop {
            let missing = (0..self.nodes)
                .filter(|node| !node_file(folder, *node).exists())
                .collect_vec();

            if missing.is_empty() {
                debug!("All {} nodes reached round {round}", self.nodes);
                return Ok(());
            }

            let waited = start.elapsed();
            if let Some(timeout) = self.timeout {
                if waited >= timeout {
                    return Err(DistributionError::BarrierTimeout {
                        round,
                        missing,
                        waited,
                    });
                }
            }

            trace!(missing = ?missing, "Waiting for nodes");
            thread::sleep(self.poll);
        }
    }

    fn gather<T: DeserializeOwned>(&self, folder: &Path) -> Result<Vec<T>, DistributionError> {
        let mut gathered = Vec::new();

        for node in 0..self.nodes {
            let reader = BufReader::new(File::open(node_file(folder, node))?);
            let items: Vec<T> = serde_json::from_reader(reader)?;
            gathered.extend(items);
        }

        Ok(gathered)
    }
}

fn node_file(folder: &Path, node: usize) -> PathBuf {
    folder.join(format!("{node}.json"))
}

/// identifier no earlier run of any node can have produced
fn nonce(rank: usize) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("{nanos:x}-{:x}-{rank}", process::id())
}

/// write `value` as `folder/name`, other nodes only ever see the complete file
fn write_json<T: Serialize + ?Sized>(
    folder: &Path,
    name: &str,
    value: &T,
) -> Result<PathBuf, DistributionError> {
    fs::create_dir_all(folder)?;
    let staging = folder.join(format!("{PROCESSING_PREFIX}{name}"));
    let target = folder.join(name);

    let mut writer = BufWriter::new(File::create(&staging)?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    // rename is atomic
    fs::rename(&staging, &target)?;

    Ok(target)
}

/// `None` while the file does not exist yet
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, DistributionError> {
    match File::open(path) {
        Ok(file) => Ok(Some(serde_json::from_reader(BufReader::new(file))?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Runtime for FsRuntime {
    fn map<T>(&self, items: Vec<T>) -> Vec<T> {
        round_robin(items, self.rank, self.nodes)
    }

    #[instrument(skip_all, fields(rank = self.rank), level = "debug")]
    fn reduce<T: Serialize + DeserializeOwned>(
        &self,
        items: Vec<T>,
    ) -> Result<Vec<T>, DistributionError> {
        let run = self.run_folder()?;
        let round = self.round.fetch_add(1, Ordering::SeqCst);
        let folder = run.join(format!("round-{round}"));

        self.publish(&folder, &items)?;
        self.wait(&folder, round)?;
        self.gather(&folder)
    }

    fn node_id(&self) -> usize {
        self.rank
    }

    fn nodes(&self) -> usize {
        self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(path: &Path, rank: usize, nodes: usize) -> FsRuntime {
        FsRuntime::new(path, "test", rank, nodes)
            .unwrap()
            .with_poll(Duration::from_millis(10))
            .with_timeout(Some(Duration::from_secs(20)))
    }

    /// one round on `nodes` concurrent nodes, each contributing `<tag>-<rank>`
    fn exchange(path: &Path, nodes: usize, tag: &str) -> Vec<Vec<String>> {
        thread::scope(|scope| {
            let handles = (0..nodes)
                .map(|rank| {
                    scope.spawn(move || {
                        node(path, rank, nodes)
                            .reduce(vec![format!("{tag}-{rank}")])
                            .unwrap()
                    })
                })
                .collect_vec();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect_vec()
        })
    }

    #[test]
    fn rejects_invalid_topology() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            FsRuntime::new(dir.path(), "test", 3, 3),
            Err(DistributionError::Topology { rank: 3, nodes: 3 })
        ));
        assert!(matches!(
            FsRuntime::new(dir.path(), "test", 0, 0),
            Err(DistributionError::Topology { .. })
        ));
    }

    #[test]
    fn nodes_gather_identical_lists_in_rank_order() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = 3;
        let items = (0..10).collect::<Vec<u32>>();

        let results = thread::scope(|scope| {
            let handles = (0..nodes)
                .map(|rank| {
                    let items = items.clone();
                    let path = dir.path();
                    scope.spawn(move || {
                        let runtime = node(path, rank, nodes);
                        let shard = runtime.map(items);
                        let first = runtime.reduce(shard).unwrap();
                        // a second round must not see the first round's files
                        let second = runtime.reduce(vec![rank as u32]).unwrap();
                        (runtime.is_master(), first, second)
                    })
                })
                .collect_vec();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect_vec()
        });

        for (rank, (is_master, first, second)) in results.into_iter().enumerate() {
            assert_eq!(is_master, rank == 0);
            assert_eq!(first, vec![0, 3, 6, 9, 1, 4, 7, 2, 5, 8]);
            assert_eq!(second, vec![0, 1, 2]);
        }
    }

    #[test]
    fn barrier_times_out_when_a_node_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path();

        let master = thread::scope(|scope| {
            let master = scope.spawn(move || {
                let runtime = node(path, 0, 2).with_timeout(Some(Duration::from_secs(2)));
                runtime.reduce(vec![0u8]).unwrap();
                runtime.reduce(vec![0u8])
            });
            // the second node leaves after the first round
            scope.spawn(move || node(path, 1, 2).reduce(vec![1u8]).unwrap());

            master.join().unwrap()
        });

        match master {
            Err(DistributionError::BarrierTimeout { round, missing, .. }) => {
                assert_eq!(round, 1);
                assert_eq!(missing, vec![1]);
            }
            other => panic!("unexpected reduce result: {other:?}"),
        }
    }

    #[test]
    fn lone_nodes_time_out_joining() {
        let dir = tempfile::tempdir().unwrap();
        let timeout = Some(Duration::from_millis(50));

        assert!(matches!(
            node(dir.path(), 0, 2).with_timeout(timeout).reduce(vec![0u8]),
            Err(DistributionError::JoinTimeout { missing, .. }) if missing == vec![1]
        ));
        assert!(matches!(
            node(dir.path(), 1, 2).with_timeout(timeout).reduce(vec![1u8]),
            Err(DistributionError::JoinTimeout { missing, .. }) if missing == vec![0]
        ));
    }

    #[test]
    fn earlier_run_in_the_same_session_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let timeout = Some(Duration::from_millis(200));

        for gathered in exchange(dir.path(), 2, "old") {
            assert_eq!(gathered, vec!["old-0", "old-1"]);
        }

        // every file of the earlier run is still there, a node alone must not get past it
        let master = node(dir.path(), 0, 2).with_timeout(timeout);
        assert!(matches!(
            master.reduce(vec![String::from("new-0")]),
            Err(DistributionError::JoinTimeout { missing, .. }) if missing == vec![1]
        ));
        let peer = node(dir.path(), 1, 2).with_timeout(timeout);
        assert!(matches!(
            peer.reduce(vec![String::from("new-1")]),
            Err(DistributionError::JoinTimeout { .. })
        ));

        for gathered in exchange(dir.path(), 2, "new") {
            assert_eq!(gathered, vec!["new-0", "new-1"]);
        }
    }

    #[test]
    fn published_file_has_no_processing_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = node(dir.path(), 0, 1);

        assert_eq!(runtime.reduce(vec!["x".to_string()]).unwrap(), vec!["x"]);

        let run = runtime.run_folder().unwrap();
        assert!(run.starts_with(dir.path().join("test")));
        let round = run.join("round-0");
        assert!(round.join("0.json").is_file());
        assert!(!round.join(format!("{PROCESSING_PREFIX}0.json")).exists());
    }
}
