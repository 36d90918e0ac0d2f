use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use snafu::{OptionExt, ResultExt, Snafu};

use tandem_feed::{ChangeFeed, FaultKind, FeedError, MemoryFeed, ParticipantId, RecordId};
use tandem_sync::{
    ConversationHandle, ConversationKey, ConversationSynchronizer, MessageDocument, SettingsError,
    SubscriptionDirection, SyncError, SyncNotice, SyncResult, SyncSettings, TimelineSnapshot,
};

const SCENARIO_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    ScenarioAOrdering,
    ScenarioBIdempotence,
    ScenarioCEmptyBody,
    ScenarioDPartialDegraded,
    SelfConversation,
    ConcurrentSenders,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "scenario_a_ordering" => Some(Self::ScenarioAOrdering),
            "scenario_b_idempotence" => Some(Self::ScenarioBIdempotence),
            "scenario_c_empty_body" => Some(Self::ScenarioCEmptyBody),
            "scenario_d_partial_degraded" => Some(Self::ScenarioDPartialDegraded),
            "self_conversation" => Some(Self::SelfConversation),
            "concurrent_senders" => Some(Self::ConcurrentSenders),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::ScenarioAOrdering => "scenario_a_ordering",
            Self::ScenarioBIdempotence => "scenario_b_idempotence",
            Self::ScenarioCEmptyBody => "scenario_c_empty_body",
            Self::ScenarioDPartialDegraded => "scenario_d_partial_degraded",
            Self::SelfConversation => "self_conversation",
            Self::ConcurrentSenders => "concurrent_senders",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("settings could not be loaded: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("sync operation failed: {source}"))]
    Sync {
        stage: &'static str,
        source: SyncError,
    },
    #[snafu(display("feed operation failed: {source}"))]
    Feed {
        stage: &'static str,
        source: FeedError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

/// `key=value` result lines, printed together once the run finishes.
#[derive(Debug, Default)]
struct Report {
    lines: Vec<String>,
}

impl Report {
    fn record(&mut self, key: &str, value: impl Display) {
        self.lines.push(format!("{key}={value}"));
    }

    fn print(&self) {
        for line in &self.lines {
            println!("{line}");
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let mut report = Report::default();
    let outcome = run(&mut report).await;
    if outcome.is_err() {
        report.record("runner_ok", false);
    }
    report.print();

    if let Err(error) = outcome {
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run(report: &mut Report) -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    report.record("scenario", args.scenario.name());

    let settings = resolve_settings(args.config_path.as_deref(), report)?;
    run_scenario(args.scenario, &settings, report).await
}

/// An explicit `--config` must load. Otherwise the per-user config file is
/// used when present, and `TANDEM_*` variables apply either way.
fn resolve_settings(config_path: Option<&Path>, report: &mut Report) -> RunnerResult<SyncSettings> {
    match config_path {
        Some(path) => {
            report.record("config_path", path.display());
            SyncSettings::load(path).context(SettingsSnafu {
                stage: "load-settings",
            })
        }
        None => {
            let path = SyncSettings::default_config_path();
            report.record("config_path", path.display());
            Ok(SyncSettings::load_or_default(&path))
        }
    }
}

async fn run_scenario(
    scenario: Scenario,
    settings: &SyncSettings,
    report: &mut Report,
) -> RunnerResult<()> {
    match scenario {
        Scenario::ScenarioAOrdering => run_ordering(settings, report).await,
        Scenario::ScenarioBIdempotence => run_idempotence(settings, report).await,
        Scenario::ScenarioCEmptyBody => run_empty_body(settings, report).await,
        Scenario::ScenarioDPartialDegraded => run_partial_degraded(settings, report).await,
        Scenario::SelfConversation => run_self_conversation(settings, report).await,
        Scenario::ConcurrentSenders => run_concurrent_senders(settings, report).await,
        Scenario::All => run_all(settings, report).await,
    }?;

    report.record("runner_ok", true);
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut config_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config_path = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        config_path,
    })
}

async fn run_all(settings: &SyncSettings, report: &mut Report) -> RunnerResult<()> {
    run_ordering(settings, report).await?;
    run_idempotence(settings, report).await?;
    run_empty_body(settings, report).await?;
    run_partial_degraded(settings, report).await?;
    run_self_conversation(settings, report).await?;
    run_concurrent_senders(settings, report).await?;

    report.record("all_passed", true);
    Ok(())
}

async fn run_ordering(settings: &SyncSettings, report: &mut Report) -> RunnerResult<()> {
    let feed = MemoryFeed::new();
    seed(&feed, settings, "alice", "bob", "m3", at(10, 2)).await?;
    seed(&feed, settings, "bob", "alice", "m2", at(10, 1)).await?;
    seed(&feed, settings, "alice", "bob", "m1", at(10, 0)).await?;

    let synchronizer = synchronizer(&feed, settings);
    let handle = open(&synchronizer, key("alice", "bob"), "scenario-a-open").await?;
    let snapshot = wait_for_len(&handle, 3, "scenario_a_ordering").await?;

    let bodies: Vec<&str> = snapshot.messages.iter().map(|message| message.body.as_str()).collect();
    report.record("timeline", bodies.join(","));
    handle.close().await;

    if bodies != ["m1", "m2", "m3"] {
        return ScenarioFailedSnafu {
            stage: "scenario-a-order",
            scenario: "scenario_a_ordering",
            reason: format!("timeline out of order: {bodies:?}"),
        }
        .fail();
    }

    report.record("ordered", true);
    Ok(())
}

async fn run_idempotence(settings: &SyncSettings, report: &mut Report) -> RunnerResult<()> {
    let feed = MemoryFeed::new();
    let synchronizer = synchronizer(&feed, settings);
    let conversation = key("alice", "bob");
    let handle = open(&synchronizer, conversation.clone(), "scenario-b-open").await?;

    for body in ["m1", "m2"] {
        handle.send(body).await.context(SyncSnafu {
            stage: "scenario-b-send",
        })?;
    }
    let before = wait_for_len(&handle, 2, "scenario_b_idempotence").await?;

    let mut updates = handle.subscribe();
    let replayed = feed
        .replay(&conversation.outgoing_query(&settings.collection))
        .await;
    let update = tokio::time::timeout(SCENARIO_DEADLINE, updates.recv())
        .await
        .ok()
        .and_then(Result::ok)
        .context(ScenarioFailedSnafu {
            stage: "scenario-b-await-replay",
            scenario: "scenario_b_idempotence",
            reason: "replayed batch was never applied".to_string(),
        })?;
    handle.close().await;

    let unchanged = update.snapshot.messages == before.messages;
    report.record("replayed_listeners", replayed);
    report.record("replay_unchanged", unchanged);
    if !unchanged {
        return ScenarioFailedSnafu {
            stage: "scenario-b-compare",
            scenario: "scenario_b_idempotence",
            reason: format!(
                "timeline changed after replay: {:?} -> {:?}",
                before.ids(),
                update.snapshot.ids()
            ),
        }
        .fail();
    }

    Ok(())
}

async fn run_empty_body(settings: &SyncSettings, report: &mut Report) -> RunnerResult<()> {
    let feed = MemoryFeed::new();
    let synchronizer = synchronizer(&feed, settings);
    let handle = open(&synchronizer, key("alice", "bob"), "scenario-c-open").await?;

    let rejected = matches!(
        handle.send("   ").await,
        Err(SyncError::EmptyBody { .. })
    );
    let inserts = feed.insert_count().await;
    handle.close().await;

    report.record("empty_body_rejected", rejected);
    report.record("insert_count", inserts);
    if !rejected || inserts != 0 {
        return ScenarioFailedSnafu {
            stage: "scenario-c-validate",
            scenario: "scenario_c_empty_body",
            reason: format!("blank body rejected={rejected}, inserts={inserts}"),
        }
        .fail();
    }

    Ok(())
}

async fn run_partial_degraded(settings: &SyncSettings, report: &mut Report) -> RunnerResult<()> {
    let feed = MemoryFeed::new();
    let conversation = key("alice", "bob");
    feed.fail_subscriptions(
        conversation.outgoing_query(&settings.collection),
        FaultKind::PermissionDenied,
    )
    .await;

    let synchronizer = synchronizer(&feed, settings);
    let mut handle = open(&synchronizer, conversation, "scenario-d-open").await?;
    let first_notice = next_notice(&mut handle, "scenario_d_partial_degraded").await?;

    synchronizer
        .sender()
        .send(&"bob".into(), &"alice".into(), "incoming still flows")
        .await
        .context(SyncSnafu {
            stage: "scenario-d-remote-send",
        })?;
    let snapshot = wait_for_len(&handle, 1, "scenario_d_partial_degraded").await?;
    let degraded = handle.is_degraded();
    handle.close().await;

    report.record("degraded", degraded);
    report.record("incoming_messages", snapshot.len());
    if !matches!(
        first_notice,
        SyncNotice::PartialSyncDegraded {
            failed: SubscriptionDirection::Outgoing,
            ..
        }
    ) {
        return ScenarioFailedSnafu {
            stage: "scenario-d-notice",
            scenario: "scenario_d_partial_degraded",
            reason: format!("unexpected first notice: {first_notice:?}"),
        }
        .fail();
    }

    Ok(())
}

async fn run_self_conversation(settings: &SyncSettings, report: &mut Report) -> RunnerResult<()> {
    let feed = MemoryFeed::new();
    let synchronizer = synchronizer(&feed, settings);
    let mut handle = open(&synchronizer, key("alice", "alice"), "self-conversation-open").await?;
    let notice = next_notice(&mut handle, "self_conversation").await?;

    handle.send("note to self").await.context(SyncSnafu {
        stage: "self-conversation-send",
    })?;
    wait_for_len(&handle, 1, "self_conversation").await?;
    // Both listeners watch the same record; let the second delivery land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let messages = handle.snapshot().len();
    handle.close().await;

    let flagged = notice == SyncNotice::SelfConversation;
    report.record("self_conversation_flagged", flagged);
    report.record("messages", messages);
    if !flagged || messages != 1 {
        return ScenarioFailedSnafu {
            stage: "self-conversation-validate",
            scenario: "self_conversation",
            reason: format!("flagged={flagged}, messages={messages}"),
        }
        .fail();
    }

    Ok(())
}

async fn run_concurrent_senders(settings: &SyncSettings, report: &mut Report) -> RunnerResult<()> {
    const ROUNDS: usize = 25;

    let feed = MemoryFeed::new();
    let synchronizer = synchronizer(&feed, settings);
    let alice = open(&synchronizer, key("alice", "bob"), "concurrent-open-alice").await?;
    let bob = open(&synchronizer, key("bob", "alice"), "concurrent-open-bob").await?;

    let sends = (0..ROUNDS).flat_map(|round| {
        [
            send_owned(&alice, format!("alice {round}")),
            send_owned(&bob, format!("bob {round}")),
        ]
    });
    for sent in futures::future::join_all(sends).await {
        sent.context(SyncSnafu {
            stage: "concurrent-send",
        })?;
    }

    let alice_view = wait_for_len(&alice, ROUNDS * 2, "concurrent_senders").await?;
    let bob_view = wait_for_len(&bob, ROUNDS * 2, "concurrent_senders").await?;
    alice.close().await;
    bob.close().await;

    let ordered = [&alice_view, &bob_view].iter().all(|view| {
        view.messages
            .windows(2)
            .all(|pair| pair[0].sent_at <= pair[1].sent_at)
    });
    report.record("messages", alice_view.len());
    report.record("ordered", ordered);
    if !ordered {
        return ScenarioFailedSnafu {
            stage: "concurrent-order",
            scenario: "concurrent_senders",
            reason: "timeline order went backwards".to_string(),
        }
        .fail();
    }

    Ok(())
}

fn synchronizer(feed: &MemoryFeed, settings: &SyncSettings) -> ConversationSynchronizer {
    ConversationSynchronizer::new(Arc::new(feed.clone()), settings.clone())
}

fn key(local: &str, remote: &str) -> ConversationKey {
    ConversationKey::new(ParticipantId::new(local), ParticipantId::new(remote))
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, hour, minute, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

async fn seed(
    feed: &MemoryFeed,
    settings: &SyncSettings,
    sender: &str,
    receiver: &str,
    body: &str,
    sent_at: DateTime<Utc>,
) -> RunnerResult<RecordId> {
    let fields = MessageDocument::new(sender.into(), receiver.into(), body, sent_at).into_fields();
    feed.insert(&settings.collection, fields)
        .await
        .context(FeedSnafu { stage: "seed-insert" })
}

async fn open(
    synchronizer: &ConversationSynchronizer,
    key: ConversationKey,
    stage: &'static str,
) -> RunnerResult<ConversationHandle> {
    synchronizer.open(key).await.context(SyncSnafu { stage })
}

async fn send_owned(handle: &ConversationHandle, body: String) -> SyncResult<RecordId> {
    handle.send(&body).await
}

async fn wait_for_len(
    handle: &ConversationHandle,
    len: usize,
    scenario: &'static str,
) -> RunnerResult<Arc<TimelineSnapshot>> {
    let waited = tokio::time::timeout(SCENARIO_DEADLINE, async {
        loop {
            let snapshot = handle.snapshot();
            if snapshot.len() >= len {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    waited.ok().context(ScenarioFailedSnafu {
        stage: "await-timeline",
        scenario,
        reason: format!(
            "timeline stuck at {} of {len} messages",
            handle.snapshot().len()
        ),
    })
}

async fn next_notice(
    handle: &mut ConversationHandle,
    scenario: &'static str,
) -> RunnerResult<SyncNotice> {
    tokio::time::timeout(SCENARIO_DEADLINE, handle.next_notice())
        .await
        .ok()
        .flatten()
        .context(ScenarioFailedSnafu {
            stage: "await-notice",
            scenario,
            reason: "no notice was queued".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use tandem_sync::settings::{SETTINGS_DIRECTORY_NAME, SETTINGS_FILE_NAME};

    use super::*;

    #[test]
    fn parse_args_requires_a_known_scenario() {
        let parsed = parse_args(["--scenario".to_string(), "all".to_string()]).expect("parse");
        assert!(matches!(parsed.scenario, Scenario::All));
        assert!(parsed.config_path.is_none());

        assert!(matches!(
            parse_args(["--scenario".to_string(), "scenario_z".to_string()]),
            Err(RunnerError::UnknownScenario { .. })
        ));
        assert!(matches!(
            parse_args(Vec::<String>::new()),
            Err(RunnerError::MissingScenario { .. })
        ));
    }

    #[test]
    fn without_config_flag_the_user_config_file_is_loaded() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let config_home = jail.directory().to_path_buf();
            jail.set_env("XDG_CONFIG_HOME", config_home.display());
            jail.set_env("TANDEM_SUBSCRIBE_TIMEOUT_MS", 75);
            jail.create_dir(SETTINGS_DIRECTORY_NAME)?;
            jail.create_file(
                Path::new(SETTINGS_DIRECTORY_NAME).join(SETTINGS_FILE_NAME),
                r#"{ "collection": "user_chat" }"#,
            )?;

            let mut report = Report::default();
            let settings = resolve_settings(None, &mut report).expect("settings");
            assert_eq!(settings.collection, "user_chat");
            assert_eq!(settings.subscribe_timeout_ms, 75);
            assert_eq!(
                report.lines,
                vec![format!(
                    "config_path={}",
                    SyncSettings::default_config_path().display()
                )]
            );
            Ok(())
        });
    }

    #[test]
    fn without_any_config_file_the_environment_still_applies() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let config_home = jail.directory().to_path_buf();
            jail.set_env("XDG_CONFIG_HOME", config_home.display());
            jail.set_env("TANDEM_COLLECTION", "env_chat");

            let settings = resolve_settings(None, &mut Report::default()).expect("settings");
            assert_eq!(settings.collection, "env_chat");
            Ok(())
        });
    }

    #[tokio::test]
    async fn running_every_scenario_reports_success_once() {
        let mut report = Report::default();
        run_scenario(Scenario::All, &SyncSettings::default(), &mut report)
            .await
            .expect("all scenarios pass");

        let count = |line: &str| report.lines.iter().filter(|recorded| *recorded == line).count();
        assert_eq!(count("runner_ok=true"), 1);
        assert_eq!(count("all_passed=true"), 1);
        assert_eq!(report.lines.last().map(String::as_str), Some("runner_ok=true"));
    }
}
