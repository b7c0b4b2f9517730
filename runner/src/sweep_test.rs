use crate::{
    artifacts::ArtifactResolver,
    command::{dimension, raw_dimension, Configuration, Entry, MODEL_OUTPUT_FLAG},
    distributed::LocalRuntime,
    executors::{local::LocalExecutor, Executors},
    grid::{points_from_file, Grid},
    sweep::{rank, winners, write_report, Sweep, SweepError, SweepResults},
    trainer::{ExternalTrainer, TrainingResult},
};
use itertools::Itertools;
use std::{fs, path::PathBuf, thread, time::Duration};

/// loss is the sum of all `--loss*` flags, no such flag means a failed run
fn score(configuration: Configuration) -> TrainingResult {
    let losses = configuration
        .entries()
        .iter()
        .filter_map(|entry| match entry {
            Entry::Flag { name, value } if name.starts_with("--loss") => value.parse::<f64>().ok(),
            _ => None,
        })
        .collect_vec();

    let loss = if losses.is_empty() {
        f64::INFINITY
    } else {
        losses.iter().sum()
    };
    TrainingResult::new(configuration, loss)
}

fn losses(results: &SweepResults) -> Vec<(String, f64)> {
    results
        .iter()
        .map(|(name, result)| (name.clone(), result.loss))
        .collect()
}

fn grid(name: &str, points: Vec<Configuration>, promote: usize, output: usize) -> Grid {
    Grid::new(name, points, promote, output).unwrap()
}

#[test]
fn single_stage_outputs_best_in_order() {
    let executor = Executors::Sequential;
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let grids = [grid("s1", dimension("--loss", [0.9, 0.2, 0.5]), 1, 2)];

    let results = sweep.run(&grids, Configuration::new(), &score).unwrap();

    assert_eq!(
        losses(&results),
        vec![(String::from("s1_0"), 0.2), (String::from("s1_1"), 0.5)]
    );
    assert_eq!(results["s1_0"].configuration.render(), "--loss 0.2");
}

#[test]
fn promoted_configurations_seed_the_next_stage() {
    let executor = Executors::Local(LocalExecutor::load(2).unwrap());
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let grids = [
        grid("hyper", dimension("--loss", [0.1, 0.3]), 1, 1),
        grid("cbtype", dimension("--loss_cb", [0.02, 0.01]), 1, 1),
    ];
    let seed = Configuration::new().with(Entry::raw("base", "--cb_adf --dsjson"));

    let results = sweep.run(&grids, seed, &score).unwrap();

    assert_eq!(
        results["cbtype_0"].configuration.render(),
        "--cb_adf --dsjson --loss 0.1 --loss_cb 0.01"
    );
    assert_eq!(results["hyper_0"].loss, 0.1);
    assert_eq!(results.len(), 2);
}

#[test]
fn second_stage_crosses_promoted_winner() {
    let executor = Executors::Sequential;
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let grids = [
        grid("s1", dimension("--loss", [0.9, 0.2, 0.5]), 1, 2),
        grid("s2", dimension("--stage_loss", [0.1, 0.3]), 1, 1),
    ];
    // the latest stage decides the loss
    let latest = |configuration: Configuration| {
        let loss = ["--stage_loss", "--loss"]
            .iter()
            .find_map(|flag| configuration.get(flag).and_then(|value| value.parse::<f64>().ok()))
            .unwrap_or(f64::INFINITY);
        TrainingResult::new(configuration, loss)
    };

    let results = sweep.run(&grids, Configuration::new(), &latest).unwrap();

    assert_eq!(
        losses(&results),
        vec![
            (String::from("s1_0"), 0.2),
            (String::from("s1_1"), 0.5),
            (String::from("s2_0"), 0.1),
        ]
    );
    assert_eq!(
        results["s2_0"].configuration.render(),
        "--loss 0.2 --stage_loss 0.1"
    );
}

#[test]
fn failed_runs_are_never_promoted_over_finite_ones() {
    let executor = Executors::Sequential;
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let points = vec![
        Configuration::new().with(Entry::flag("--broken", 1)),
        Configuration::new().with(Entry::flag("--loss", 0.5)),
    ];
    let grids = [
        grid("first", points, 2, 2),
        grid("second", raw_dimension("noop", [""]), 5, 5),
    ];

    let results = sweep.run(&grids, Configuration::new(), &score).unwrap();

    // only the finite run was output and promoted
    assert_eq!(
        losses(&results),
        vec![(String::from("first_0"), 0.5), (String::from("second_0"), 0.5)]
    );
}

#[test]
fn stage_where_everything_fails_still_promotes() {
    let executor = Executors::Sequential;
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let grids = [grid("broken", dimension("--broken", [1, 2]), 1, 1)];

    let results = sweep.run(&grids, Configuration::new(), &score).unwrap();

    assert!(results["broken_0"].loss.is_infinite());
    assert_eq!(results["broken_0"].configuration.render(), "--broken 1");
}

#[test]
fn ties_keep_gathered_order() {
    let mut ranked = vec![
        TrainingResult::new(Configuration::new().with(Entry::flag("-a", 1)), 0.3),
        TrainingResult::failed(Configuration::new().with(Entry::flag("-b", 1))),
        TrainingResult::new(Configuration::new().with(Entry::flag("-c", 1)), 0.3),
        TrainingResult::new(Configuration::new().with(Entry::flag("-d", 1)), 0.1),
    ];

    rank(&mut ranked);

    let order = ranked.iter().map(|result| result.configuration.render()).collect_vec();
    assert_eq!(order, vec!["-d 1", "-a 1", "-c 1", "-b 1"]);
    assert_eq!(winners(&ranked, 10).len(), 3);
    assert_eq!(winners(&ranked, 2).len(), 2);
}

#[test]
fn empty_stage_is_an_error() {
    let executor = Executors::Sequential;
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let grids = [grid("nothing", Vec::new(), 1, 1)];

    assert!(matches!(
        sweep.run(&grids, Configuration::new(), &score),
        Err(SweepError::EmptyGrid(name)) if name == "nothing"
    ));
}

#[test]
fn results_are_generalized() {
    let executor = Executors::Sequential;
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let grids = [grid("s", dimension("--loss", [0.4]), 1, 1)];
    let with_model = |configuration: Configuration| {
        let mut result = score(configuration);
        result.configuration.set(MODEL_OUTPUT_FLAG, "/tmp/model");
        result
    };

    let results = sweep.run(&grids, Configuration::new(), &with_model).unwrap();

    assert_eq!(results["s_0"].configuration.get(MODEL_OUTPUT_FLAG), None);
}

#[test]
fn checkpoint_stores_expanded_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Executors::Sequential;
    let sweep =
        Sweep::new(&LocalRuntime, &executor).with_checkpoint(Some(dir.path().to_path_buf()));
    let grids = [grid("s", dimension("--loss", [0.4, 0.2]), 1, 1)];
    let seed = Configuration::new().with(Entry::raw("base", "--cb_adf"));

    sweep.run(&grids, seed, &score).unwrap();

    let stored = points_from_file(&dir.path().join("s.jsonl"), None).unwrap();
    let rendered = stored.iter().map(Configuration::render).collect_vec();
    assert_eq!(rendered, vec!["--cb_adf --loss 0.4", "--cb_adf --loss 0.2"]);
}

#[cfg(feature = "distributed")]
#[test]
fn nodes_sharing_a_folder_agree_on_results() {
    use crate::distributed::fs::FsRuntime;

    let dir = tempfile::tempdir().unwrap();
    let nodes = 2;
    let grids = [
        grid("hyper", dimension("--loss", [0.5, 0.1, 0.4, 0.3, 0.2]), 2, 2),
        grid("cbtype", dimension("--loss_cb", [0.03, 0.01, 0.02]), 1, 1),
    ];

    let results = thread::scope(|scope| {
        let handles = (0..nodes)
            .map(|rank| {
                let path = dir.path();
                let grids = &grids;
                scope.spawn(move || {
                    let runtime = FsRuntime::new(path, "sweep", rank, nodes)
                        .unwrap()
                        .with_poll(Duration::from_millis(10))
                        .with_timeout(Some(Duration::from_secs(30)));
                    let executor = Executors::Sequential;
                    let sweep = Sweep::new(&runtime, &executor);

                    sweep.run(grids, Configuration::new(), &score).unwrap()
                })
            })
            .collect_vec();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect_vec()
    });

    assert_eq!(losses(&results[0]), losses(&results[1]));
    assert_eq!(
        results[0]["cbtype_0"].configuration.render(),
        "--loss 0.1 --loss_cb 0.01"
    );
    assert_eq!(results[0]["hyper_1"].loss, 0.2);
}

#[test]
fn report_marks_failed_runs_as_null() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("report.json");
    let mut results = SweepResults::new();
    results.insert(
        String::from("s_0"),
        TrainingResult::new(Configuration::new().with(Entry::flag("-l", 0.1)), 0.25),
    );
    results.insert(String::from("s_1"), TrainingResult::failed(Configuration::new()));

    write_report(&results, &SweepResults::new(), &path).unwrap();

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(report["s_0"]["command"], "-l 0.1");
    assert_eq!(report["s_0"]["loss"], 0.25);
    assert!(report["s_1"]["loss"].is_null());
    assert!(report["s_0"].get("prediction").is_none());
}

#[test]
fn report_carries_predictions_next_to_winners() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    let executor = Executors::Sequential;
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let winner = Configuration::new().with(Entry::flag("-l", 0.1));
    let mut results = SweepResults::new();
    results.insert(String::from("s_0"), TrainingResult::new(winner.clone(), 0.25));
    results.insert(String::from("s_1"), TrainingResult::new(winner.clone(), 0.5));
    let mut predictions = SweepResults::new();
    predictions.insert(
        String::from("s_0"),
        TrainingResult::new(winner.with(Entry::flag("-p", "/pred/s_0.b.pred")), 0.3),
    );

    assert!(sweep.write_report(&results, &predictions, &path).unwrap());

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(report["s_0"]["command"], "-l 0.1");
    assert_eq!(report["s_0"]["prediction"]["command"], "-l 0.1 -p /pred/s_0.b.pred");
    assert_eq!(report["s_0"]["prediction"]["loss"], 0.3);
    assert!(report["s_0"]["prediction"]["configuration"].is_array());
    assert!(report["s_1"].get("prediction").is_none());
}

const CACHING_LEARNER: &str = r#"
data=""
cache=""
while [ $# -gt 0 ]; do
    case "$1" in
        -d) data="$2"; shift ;;
        --cache_file) cache="$2"; shift ;;
        -f|-p) : > "$2"; shift ;;
    esac
    shift
done
case "$data" in
    *broken*) exit 1 ;;
esac
if [ -n "$cache" ]; then : > "$cache"; fi
echo "average loss = 0.5" >&2
"#;

fn caching_trainer(dir: &std::path::Path) -> ExternalTrainer {
    let script = dir.join("learner.sh");
    fs::write(&script, CACHING_LEARNER).unwrap();

    ExternalTrainer::new("/bin/sh", ArtifactResolver::new(dir.join("artifacts")))
        .with_params(vec![script.display().to_string()])
}

#[test]
fn prepare_keeps_data_order_and_skips_failed_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = caching_trainer(dir.path());
    let executor = Executors::Local(LocalExecutor::load(3).unwrap());
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let data = ["2019/01/01.json", "2019/01/broken.json", "2019/01/02.json"]
        .iter()
        .map(|file| dir.path().join("data").join(file))
        .collect_vec();
    let base = Configuration::new().with(Entry::raw("base", "--cb_adf"));

    let caches = sweep.prepare(&trainer, &base, &data).unwrap();

    let names = caches
        .iter()
        .map(|cache| cache.file_name().unwrap().to_string_lossy().into_owned())
        .collect_vec();
    assert_eq!(names, vec!["2019_01_01.cache", "2019_01_02.cache"]);
}

#[test]
fn prepare_without_any_cache_fails() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = caching_trainer(dir.path());
    let executor = Executors::Sequential;
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let data = vec![dir.path().join("broken.json")];

    assert!(matches!(
        sweep.prepare(&trainer, &Configuration::new(), &data),
        Err(SweepError::NoPartitions)
    ));
}

#[test]
fn predict_applies_overrides_on_master() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = caching_trainer(dir.path());
    let executor = Executors::Sequential;
    let sweep = Sweep::new(&LocalRuntime, &executor);
    let caches = vec![dir.path().join("a.cache"), dir.path().join("b.cache")];
    let mut results = SweepResults::new();
    results.insert(
        String::from("s_0"),
        TrainingResult::new(
            Configuration::new()
                .with(Entry::raw("base", "--cb_adf"))
                .with(Entry::flag("-l", 0.1)),
            0.2,
        ),
    );
    let overrides = Configuration::new().with(Entry::raw("base", "--cb_explore_adf"));

    let predicted = sweep.predict(&trainer, &caches, &results, &overrides);

    let result = &predicted["s_0"];
    assert_eq!(result.loss, 0.5);
    assert!(result.configuration.render().starts_with("--cb_explore_adf -l 0.1"));
    let predictions = PathBuf::from(result.configuration.get("-p").unwrap());
    assert_eq!(predictions.file_name().unwrap(), "s_0.b.pred");
    assert!(predictions.exists());
}
