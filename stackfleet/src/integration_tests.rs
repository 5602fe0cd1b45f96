//! Full run lifecycles against the in-memory cloud.

use crate::cloud::object_url;
use crate::config::ProjectConfig;
use crate::errors::FleetError;
use crate::observability::{CollectingProgressSink, ProgressEvent, ProgressSink};
use crate::orchestrator::{run_with, Fleet, FleetOptions, RunOptions, StackFilter, TestRun};
use crate::stack::{StackStatus, StatusBucket};
use crate::stage::{generate_regional_bucket_name, SyncOptions, CONFIG_FILE_NAME};
use crate::template::TemplateLoader;
use crate::testing::{InMemoryCloud, Project, ProjectBuilder, StackScript};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const ACCOUNT: &str = "123456789012";

const MAIN: &str = "\
Parameters:
  Password:
    Type: String
  Zone:
    Type: String
Resources:
  Topic:
    Type: AWS::SNS::Topic
";

const PARENT: &str = "\
Resources:
  Child:
    Type: AWS::CloudFormation::Stack
    Properties:
      TemplateURL: https://example.s3.amazonaws.com/demo/templates/child.yaml
";

const CHILD: &str = "\
Resources:
  Queue:
    Type: AWS::SQS::Queue
";

const CONFIG: &str = "\
project:
  name: demo
  regions: [us-east-1, eu-west-1]
  s3_regional_buckets: true
  parameters:
    Password: $[taskcat_genpass_12]
tests:
  alpha:
    template: templates/main.yaml
    stack_name: alpha
    parameters:
      Zone: $[taskcat_gensingleaz_1]
  beta:
    template: templates/main.yaml
    stack_name: beta
    parameters:
      Zone: $[taskcat_current_region]
";

fn project() -> Project {
    ProjectBuilder::new()
        .file(CONFIG_FILE_NAME, CONFIG)
        .file("templates/main.yaml", MAIN)
        .file("templates/parent.yaml", PARENT)
        .file("templates/child.yaml", CHILD)
        .file("README.md", "# demo\n")
        .build()
}

fn test_run(cloud: &InMemoryCloud, options: RunOptions, sink: &Arc<CollectingProgressSink>) -> TestRun {
    TestRun::new(cloud.client_cache(), options)
        .with_fleet_options(FleetOptions::new().with_poll_interval(Duration::from_millis(1)))
        .with_sync_options(SyncOptions::new().with_retry(crate::retry::RetryConfig::new().with_base_delay_ms(1)))
        .with_sink(Arc::clone(sink) as Arc<dyn ProgressSink>)
}

#[tokio::test]
async fn test_two_tests_in_two_regions_succeed() {
    let cloud = InMemoryCloud::new();
    cloud.script_stack("alpha", StackScript::succeeds_after(2));
    cloud.script_stack("beta", StackScript::succeeds_after(1));
    let project = project();
    let sink = Arc::new(CollectingProgressSink::new());

    let outcome = test_run(&cloud, RunOptions::new(project.path()), &sink)
        .execute()
        .await
        .unwrap();
    assert_eq!(outcome.status.complete.len(), 4);
    assert_eq!(outcome.exit_code(), 0);

    let finished: Vec<ProgressEvent> = sink.events_of_type("run.finished");
    assert_eq!(
        finished,
        vec![ProgressEvent::RunFinished {
            complete: 4,
            failed: 0
        }]
    );
    assert_eq!(cloud.delete_requests().len(), 4);
    for region in ["us-east-1", "eu-west-1"] {
        let bucket = generate_regional_bucket_name(ACCOUNT, region);
        assert_eq!(cloud.bucket_location(&bucket), None);
    }
}

#[tokio::test]
async fn test_failures_reported_once_after_teardown() {
    let cloud = InMemoryCloud::new();
    cloud.script_stack("alpha", StackScript::succeeds_after(1));
    cloud.script_stack("beta", StackScript::fails_after(2, "Topic policy invalid"));
    let project = project();
    let sink = Arc::new(CollectingProgressSink::new());

    let err = run_with(test_run(&cloud, RunOptions::new(project.path()), &sink))
        .await
        .unwrap_err();
    let FleetError::StackFailure(failure) = err else {
        panic!("expected a stack failure");
    };
    assert_eq!(failure.failed.len(), 2);
    assert!(failure.failed.iter().all(|f| f.test_name == "beta"));
    assert_eq!(cloud.delete_requests().len(), 4);

    let failed_changes = sink
        .events_of_type("stack.status_changed")
        .into_iter()
        .filter(|e| matches!(e, ProgressEvent::StatusChanged { bucket: StatusBucket::Failed, .. }))
        .count();
    assert_eq!(failed_changes, 2);
}

#[tokio::test]
async fn test_staged_layout_and_skip_delete() {
    let cloud = InMemoryCloud::new();
    let project = project();
    let sink = Arc::new(CollectingProgressSink::new());

    let outcome = test_run(
        &cloud,
        RunOptions::new(project.path())
            .with_skip_delete(true)
            .with_test_names(["alpha"])
            .with_regions(["us-east-1"]),
        &sink,
    )
    .execute()
    .await
    .unwrap();

    assert_eq!(outcome.summaries.len(), 1);
    assert!(cloud.delete_requests().is_empty());
    let bucket = generate_regional_bucket_name(ACCOUNT, "us-east-1");
    assert_eq!(
        cloud.object_keys(&bucket),
        vec![
            "demo/templates/child.yaml".to_string(),
            "demo/templates/main.yaml".to_string(),
            "demo/templates/parent.yaml".to_string(),
        ]
    );

    let resolved = ProjectConfig::load(&project.join(CONFIG_FILE_NAME))
        .unwrap()
        .resolve()
        .unwrap();
    let mut fleet = Fleet::from_existing(&cloud.client_cache(), outcome.run_id, &resolved, FleetOptions::new())
        .await
        .unwrap();
    assert_eq!(fleet.len(), 1);
    assert!(fleet.delete_stacks(&StackFilter::all()).await.is_empty());
    assert_eq!(cloud.delete_requests().len(), 1);
}

#[tokio::test]
async fn test_nested_failure_surfaces_resource_cause() {
    let cloud = InMemoryCloud::new();
    let project = project();
    project.write(
        CONFIG_FILE_NAME,
        "project:\n  name: demo\n  regions: [us-east-1]\n  s3_regional_buckets: true\ntests:\n  nested:\n    template: templates/parent.yaml\n    stack_name: nested\n",
    );
    let bucket = generate_regional_bucket_name(ACCOUNT, "us-east-1");
    let child_url = object_url(&bucket, "us-east-1", "aws", "demo/templates/child.yaml");
    cloud.script_stack(
        "nested",
        StackScript::fails_after(1, "The following resource(s) failed to create: [Child]. ").with_child(
            "Child",
            child_url,
            StackScript::fails_after(0, "Queue name already taken"),
        ),
    );
    let sink = Arc::new(CollectingProgressSink::new());

    let outcome = test_run(
        &cloud,
        RunOptions::new(project.path()).with_keep_failed(true),
        &sink,
    )
    .execute()
    .await
    .unwrap();
    assert_eq!(outcome.status.failed.len(), 1);
    assert_eq!(outcome.summaries[0].children.len(), 1);
    assert!(cloud.delete_requests().is_empty());

    let resolved = ProjectConfig::load(&project.join(CONFIG_FILE_NAME))
        .unwrap()
        .resolve()
        .unwrap();
    let mut fleet = Fleet::from_existing(&cloud.client_cache(), outcome.run_id, &resolved, FleetOptions::new())
        .await
        .unwrap();
    fleet.wait(&TemplateLoader::new(project.path())).await.unwrap();
    assert_eq!(fleet.stacks()[0].children()[0].status(), &StackStatus::CreateFailed);

    let specific = fleet.error_events(&StackFilter::all(), false, true).await.unwrap();
    assert!(specific.iter().any(|e| e.status_reason == "Queue name already taken"));
    assert!(specific.iter().all(|e| !e.is_generic()));

    let everything = fleet.error_events(&StackFilter::all(), true, false).await.unwrap();
    assert!(everything.iter().any(crate::stack::Event::is_generic));
}
