mod common;

use common::{RecordingRunner, complete_project, gps_photos, quiet_config};
use drone_pipeline::config::load_json_file;
use drone_pipeline::runner::CommandRunner;
use drone_pipeline::{CancelToken, Pipeline, PipelineError, ProjectTree, StageId};
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

fn pipeline_with(
    config: drone_pipeline::PipelineConfig,
    tree: &ProjectTree,
    runner: &Arc<RecordingRunner>,
) -> Pipeline {
    let runner: Arc<dyn CommandRunner> = runner.clone();
    Pipeline::new(config, tree.clone(), runner)
}

#[test]
fn finished_project_skips_every_stage() {
    common::init_logging();
    let dir = tempdir().unwrap();
    let tree = ProjectTree::new(dir.path());
    let photos = gps_photos(3);
    complete_project(&tree, &photos);

    let runner = Arc::new(RecordingRunner::new(dir.path()));
    let summary = pipeline_with(quiet_config(), &tree, &runner)
        .run(&photos)
        .unwrap();

    assert!(summary.executed.is_empty());
    assert_eq!(summary.skipped, StageId::ALL.to_vec());
    assert!(runner.commands().is_empty());

    let benchmark = fs::read_to_string(&tree.benchmark_log).unwrap();
    assert_eq!(benchmark.lines().count(), StageId::ALL.len());
    assert!(benchmark.starts_with("Load Dataset: "));
}

#[test]
fn rerun_from_report_only_rewrites_the_report() {
    common::init_logging();
    let dir = tempdir().unwrap();
    let tree = ProjectTree::new(dir.path());
    let photos = gps_photos(3);
    complete_project(&tree, &photos);

    let config = drone_pipeline::PipelineConfig {
        rerun_from: Some(StageId::Report),
        ..quiet_config()
    };
    let runner = Arc::new(RecordingRunner::new(dir.path()));
    let summary = pipeline_with(config, &tree, &runner).run(&photos).unwrap();

    assert_eq!(summary.executed, vec![StageId::Report]);
    assert!(runner.commands().is_empty());

    let report: Value = load_json_file(&tree.report_json).unwrap();
    assert_eq!(report["images"], 3);
    assert_eq!(report["georeferenced"], true);
    assert_eq!(report["bands"][0], "RGB");
    assert!(report["date_collected"].as_str().unwrap().starts_with("2020-09-13"));
}

#[test]
fn rerun_from_orthophoto_renders_and_builds_overviews() {
    common::init_logging();
    let dir = tempdir().unwrap();
    let tree = ProjectTree::new(dir.path());
    let photos = gps_photos(3);
    complete_project(&tree, &photos);

    let config = drone_pipeline::PipelineConfig {
        rerun_from: Some(StageId::Orthophoto),
        ..quiet_config()
    };
    let runner = Arc::new(RecordingRunner::new(dir.path()));
    let summary = pipeline_with(config, &tree, &runner).run(&photos).unwrap();

    assert_eq!(summary.executed, vec![StageId::Orthophoto, StageId::Report]);
    assert_eq!(summary.skipped.len(), 8);

    let commands = runner.commands();
    assert_eq!(commands.len(), 2);
    let render = &commands[0];
    assert!(render.starts_with("odm_orthophoto -inputFiles"));
    assert!(render.contains("odm_texturing_25d"));
    assert!(render.contains("-resolution 20.0"));
    assert!(render.contains("-inpaintThreshold 1.0"));
    assert!(render.contains("-a_srs"));
    assert!(!render.contains("-bands"));
    assert!(commands[1].starts_with("gdaladdo -r average"));
}

#[test]
fn tool_failure_names_the_stage() {
    common::init_logging();
    let dir = tempdir().unwrap();
    let tree = ProjectTree::new(dir.path());
    let photos = gps_photos(3);
    complete_project(&tree, &photos);

    let config = drone_pipeline::PipelineConfig {
        rerun_from: Some(StageId::Orthophoto),
        ..quiet_config()
    };
    let runner = Arc::new(RecordingRunner::failing(dir.path()));
    let err = pipeline_with(config, &tree, &runner)
        .run(&photos)
        .unwrap_err();

    match &err {
        PipelineError::Stage { stage, source } => {
            assert_eq!(*stage, StageId::Orthophoto);
            assert!(matches!(**source, PipelineError::ExternalTool { status: -2, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.status(), -2);
    assert_eq!(runner.commands().len(), 1);
}

#[test]
fn empty_photo_list_is_missing_input() {
    common::init_logging();
    let dir = tempdir().unwrap();
    let tree = ProjectTree::new(dir.path());
    let runner = Arc::new(RecordingRunner::new(dir.path()));

    let err = pipeline_with(quiet_config(), &tree, &runner)
        .run(&[])
        .unwrap_err();
    assert!(matches!(err, PipelineError::MissingInput { .. }));
    assert!(runner.commands().is_empty());
}

#[test]
fn cancelled_run_stops_before_the_first_stage() {
    common::init_logging();
    let dir = tempdir().unwrap();
    let tree = ProjectTree::new(dir.path());
    let runner = Arc::new(RecordingRunner::new(dir.path()));

    let cancel = CancelToken::new();
    let pipeline = pipeline_with(quiet_config(), &tree, &runner).with_cancel_token(cancel.clone());
    cancel.cancel();

    let err = pipeline.run(&gps_photos(2)).unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert!(!tree.images_json.exists());
    assert!(runner.commands().is_empty());
}

#[test]
fn dataset_stage_writes_image_inventory() {
    common::init_logging();
    let dir = tempdir().unwrap();
    let tree = ProjectTree::new(dir.path());
    let photos = gps_photos(4);
    complete_project(&tree, &photos);
    fs::remove_file(&tree.images_json).unwrap();

    let runner = Arc::new(RecordingRunner::new(dir.path()));
    let summary = pipeline_with(quiet_config(), &tree, &runner)
        .run(&photos)
        .unwrap();

    assert_eq!(summary.executed, vec![StageId::Dataset]);
    let images: Value = load_json_file(&tree.images_json).unwrap();
    assert_eq!(images.as_array().unwrap().len(), 4);
    let list = fs::read_to_string(&tree.img_list).unwrap();
    assert_eq!(list.lines().next(), Some("IMG_0000.JPG"));
}
