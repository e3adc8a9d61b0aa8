use async_trait::async_trait;
use chrono::Utc;
use maestro::maestro::client::{AgentClient, AgentReply, ClientResult, Message};
use maestro::maestro::party::{
    aggregate_consensus, build_isolated_context, chain_hash, check_sidecar_access, load_team,
    verify_response_chain, ChainedResponse, Consensus, IncomingResponse, PartyCoordinator,
    PartyError, MAX_ROUNDS,
};
use maestro::maestro::paths::Resolver;
use maestro::maestro::state::StateStore;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct AgreeableClient {
    line: String,
}

#[async_trait]
impl AgentClient for AgreeableClient {
    async fn invoke(&self, _messages: &[Message]) -> ClientResult<AgentReply> {
        Ok(AgentReply::text(self.line.clone()))
    }

    fn model_name(&self) -> &str {
        "sonnet-core"
    }
}

fn write_roster(dir: &Path, rows: &[&str]) -> std::path::PathBuf {
    let roster = dir.join("team.csv");
    let mut content = String::from("agent_type,role,priority,tools,model\n");
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    std::fs::write(&roster, content).unwrap();
    roster
}

fn write_agent_files(dir: &Path, agents: &[&str]) -> std::path::PathBuf {
    let agents_dir = dir.join("agents");
    std::fs::create_dir_all(&agents_dir).unwrap();
    for agent in agents {
        std::fs::write(
            agents_dir.join(format!("{}.md", agent)),
            format!("# {}\nA debate participant.\n", agent),
        )
        .unwrap();
    }
    agents_dir
}

struct Rig {
    dir: TempDir,
    coordinator: PartyCoordinator,
    state: Arc<StateStore>,
}

fn rig(agents: &[&str]) -> Rig {
    let dir = TempDir::new().unwrap();
    let resolver = Arc::new(Resolver::new(dir.path()));
    let state = Arc::new(StateStore::new(resolver));
    let agents_dir = write_agent_files(dir.path(), agents);
    let coordinator = PartyCoordinator::new(Arc::clone(&state), agents_dir);
    Rig {
        dir,
        coordinator,
        state,
    }
}

fn chained(prev: &str, agent_id: &str, content: &str) -> ChainedResponse {
    let timestamp = Utc::now().to_rfc3339();
    ChainedResponse {
        agent_id: agent_id.to_string(),
        agent_name: agent_id.to_string(),
        display_name: agent_id.to_string(),
        icon: String::new(),
        content: content.to_string(),
        timestamp: timestamp.clone(),
        hash: chain_hash(prev, agent_id, content, &timestamp),
    }
}

#[test]
fn test_chain_verifies_and_detects_tampering_at_index_zero() {
    let first = chained("0", "agent_a", "I propose plan A");
    let second = chained(&first.hash, "agent_b", "AGREE with plan A");
    let third = chained(&second.hash, "agent_c", "AGREE as well");
    let mut chain = vec![first, second, third];

    let verdict = verify_response_chain(&chain);
    assert!(verdict.valid);
    assert_eq!(verdict.tampered_at, None);

    // A middleware edits the first response after the fact.
    chain[0].content = "I propose plan B".to_string();
    let verdict = verify_response_chain(&chain);
    assert!(!verdict.valid);
    assert_eq!(verdict.tampered_at, Some(0));
}

#[tokio::test]
async fn test_tampered_chain_terminates_session_with_security_event() {
    let rig = rig(&["analyst", "critic"]);
    let roster = write_roster(
        rig.dir.path(),
        &[
            "analyst,analysis,1,Read,sonnet-core",
            "critic,review,2,Read,sonnet-core",
        ],
    );
    let mut session = rig.coordinator.start_session("duo", &roster).unwrap();

    // Seed a legitimate response, then tamper with it.
    let agent_id = session.agents[0].id.clone();
    let identity = session.agents[0].identity_hash.clone();
    rig.coordinator
        .accept_response(
            &mut session,
            IncomingResponse {
                agent_id,
                identity_hash: identity,
                content: "original position".to_string(),
                timestamp: Utc::now().to_rfc3339(),
            },
        )
        .unwrap();
    session.chain[0].content = "forged position".to_string();

    let clients: BTreeMap<String, Arc<dyn AgentClient>> = BTreeMap::new();
    let err = rig
        .coordinator
        .run_round(&mut session, &json!({}), "continue", &clients)
        .await
        .unwrap_err();
    assert!(matches!(err, PartyError::ChainBroken(0)));
    assert!(session.terminated);

    // The CRITICAL event reached the security log, evidence intact.
    let security_log = rig.dir.path().join("runtime/logs/security-events.jsonl");
    assert!(security_log.exists());
    assert_eq!(session.chain[0].content, "forged position");
}

#[test]
fn test_identity_mismatch_is_rejected_and_terminates() {
    let rig = rig(&["analyst", "critic"]);
    let roster = write_roster(
        rig.dir.path(),
        &[
            "analyst,analysis,1,Read,sonnet-core",
            "critic,review,2,Read,sonnet-core",
        ],
    );
    let mut session = rig.coordinator.start_session("duo", &roster).unwrap();
    let agent_id = session.agents[0].id.clone();

    let err = rig
        .coordinator
        .accept_response(
            &mut session,
            IncomingResponse {
                agent_id,
                identity_hash: "deadbeef".to_string(),
                content: "spoofed".to_string(),
                timestamp: Utc::now().to_rfc3339(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, PartyError::IdentityMismatch(_)));
    assert!(session.terminated);
    assert!(session.chain.is_empty());
}

#[tokio::test]
async fn test_round_isolates_contexts_chains_responses_and_reaches_consensus() {
    let rig = rig(&["analyst", "critic"]);
    let roster = write_roster(
        rig.dir.path(),
        &[
            "analyst,analysis,1,Read,sonnet-core",
            "critic,review,2,Read,sonnet-core",
        ],
    );
    let mut session = rig.coordinator.start_session("duo", &roster).unwrap();

    let mut clients: BTreeMap<String, Arc<dyn AgentClient>> = BTreeMap::new();
    clients.insert(
        "analyst".to_string(),
        Arc::new(AgreeableClient {
            line: "I AGREE with the proposal".to_string(),
        }),
    );
    clients.insert(
        "critic".to_string(),
        Arc::new(AgreeableClient {
            line: "I AGREE after review".to_string(),
        }),
    );

    let shared = json!({
        "topic": "caching strategy",
        "_orchestratorState": {"secret": "internal"},
    });
    let (consensus, share) = rig
        .coordinator
        .run_round(&mut session, &shared, "debate the cache", &clients)
        .await
        .unwrap();

    assert_eq!(session.round_count, 1);
    assert_eq!(session.chain.len(), 2);
    assert!(verify_response_chain(&session.chain).valid);
    assert_eq!(consensus, Consensus::Strong);
    assert!(share >= 0.8);

    // Deterministic order: chained by agent id.
    let mut ids: Vec<String> = session.chain.iter().map(|r| r.agent_id.clone()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
    ids.dedup();
    assert_eq!(ids.len(), 2);
}

#[test]
fn test_round_limit_is_enforced() {
    let rig = rig(&["analyst"]);
    let roster = write_roster(rig.dir.path(), &["analyst,analysis,1,Read,sonnet-core"]);
    let mut session = rig.coordinator.start_session("solo", &roster).unwrap();
    session.round_count = MAX_ROUNDS;

    let clients: BTreeMap<String, Arc<dyn AgentClient>> = BTreeMap::new();
    let err = tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(rig.coordinator.run_round(&mut session, &json!({}), "more", &clients))
        .unwrap_err();
    assert!(matches!(err, PartyError::RoundLimitReached));
}

#[test]
fn test_isolated_context_strips_forbidden_and_internal_keys() {
    let first = chained("0", "agent_a", "position with rawThinking elsewhere");
    let shared = json!({
        "topic": "design",
        "_orchestratorState": {"step": 3},
        "_sessionSecrets": {"key": "abc"},
        "coordination_state": {"queue": []},
        "_internalScratch": true,
    });

    let context = build_isolated_context(&shared, "agent_b_id", &[first]);
    let map = context.as_object().unwrap();

    assert!(map.contains_key("topic"));
    assert!(!map.contains_key("_orchestratorState"));
    assert!(!map.contains_key("_sessionSecrets"));
    assert!(!map.contains_key("coordination_state"));
    assert!(!map.contains_key("_internalScratch"));
    assert_eq!(map["_isolationBoundary"], json!(true));
    assert_eq!(map["_agentId"], json!("agent_b_id"));

    // Sibling responses carry only the six public fields.
    let previous = map["previous_responses"].as_array().unwrap();
    let sibling = previous[0].as_object().unwrap();
    let mut keys: Vec<&str> = sibling.keys().map(|k| k.as_str()).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec!["agentName", "content", "displayName", "hash", "icon", "timestamp"]
    );
}

#[test]
fn test_security_architect_weighting_tips_consensus_on_security_topics() {
    let rig = rig(&["security-architect", "builder", "designer"]);
    let roster = write_roster(
        rig.dir.path(),
        &[
            "security-architect,security-architect,1,Read,opus-deep",
            "builder,engineering,2,Read,sonnet-core",
            "designer,design,3,Read,sonnet-core",
        ],
    );
    let session = rig.coordinator.start_session("trio", &roster).unwrap();

    let security = &session.agents[0];
    let builder = &session.agents[1];
    let designer = &session.agents[2];

    let first = chained("0", &security.id, "I AGREE this fixes the vulnerability");
    let second = chained(&first.hash, &builder.id, "I DISAGREE with this change");
    let third = chained(&second.hash, &designer.id, "I AGREE with the fix");
    let chain = vec![first, second, third];

    // On a security topic the architect's vote weighs 1.5: 2.5 / 3.5 ≈ 71%.
    let (consensus, share) = aggregate_consensus(&chain, &session.agents, "security review of auth");
    assert_eq!(consensus, Consensus::Weak);
    assert!((share - 2.5 / 3.5).abs() < 1e-9);

    // On a neutral topic the same votes are a 2/3 split.
    let (_, neutral_share) = aggregate_consensus(&chain, &session.agents, "refactor discussion");
    assert!((neutral_share - 2.0 / 3.0).abs() < 1e-9);
}

#[test]
fn test_team_loading_rejects_oversized_and_unknown_teams() {
    let rig = rig(&["a", "b", "c", "d", "e"]);
    let roster = write_roster(
        rig.dir.path(),
        &[
            "a,r,1,Read,m",
            "b,r,2,Read,m",
            "c,r,3,Read,m",
            "d,r,4,Read,m",
            "e,r,5,Read,m",
        ],
    );
    let agents_dir = rig.dir.path().join("agents");
    assert!(matches!(
        load_team(&roster, &agents_dir),
        Err(PartyError::TeamTooLarge(5))
    ));

    let roster = write_roster(rig.dir.path(), &["ghost,r,1,Read,m"]);
    assert!(matches!(
        load_team(&roster, &agents_dir),
        Err(PartyError::MissingAgentFile(_))
    ));

    let roster = write_roster(rig.dir.path(), &["a,r,not-a-number,Read,m"]);
    assert!(matches!(
        load_team(&roster, &agents_dir),
        Err(PartyError::MalformedRoster(_))
    ));
}

#[test]
fn test_sidecar_ownership_check() {
    let root = Path::new("/tmp/sidecars");
    assert!(check_sidecar_access(root, "agent_a", Path::new("/tmp/sidecars/agent_a/notes.md")).is_ok());
    assert!(check_sidecar_access(root, "agent_a", Path::new("/tmp/sidecars/agent_b/notes.md")).is_err());
    // Traversal cannot escape the check.
    assert!(check_sidecar_access(
        root,
        "agent_b",
        Path::new("/tmp/sidecars/agent_b/../agent_a/notes.md")
    )
    .is_err());
    // Paths outside the sidecar tree are not this check's business.
    assert!(check_sidecar_access(root, "agent_a", Path::new("/tmp/elsewhere/file.txt")).is_ok());
    // A sidecar access with no identity is rejected.
    assert!(check_sidecar_access(root, "", Path::new("/tmp/sidecars/agent_a/notes.md")).is_err());
}
