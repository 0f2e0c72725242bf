mod common;

use common::*;
use parley_agent::{ChatEvent, FailureCategory, TurnOutcome};
use parley_core::session::{Attachment, Citation, Mode, Role, FAILURE_SEPARATOR, PLACEHOLDER_TITLE};
use parley_core::Error;
use parley_providers::{Fragment, Part, ProviderError, Tool};
use std::sync::Arc;
use tokio::sync::Notify;

#[tokio::test]
async fn test_hello_turn_sets_title_and_appends_two_messages() {
    let provider = ScriptedProvider::new(vec![Reply::Steps(vec![
        text("Hi "),
        text("there!"),
    ])]);
    let (lifecycle, mut rx) = sign_in(provider.clone()).await;
    let before = lifecycle.active_session().unwrap();
    assert_eq!(before.title, PLACEHOLDER_TITLE);

    let outcome = lifecycle.submit("Hello", Vec::new()).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let session = lifecycle.active_session().unwrap();
    assert_eq!(session.title, "Hello");
    assert_eq!(session.messages.len(), 3);
    assert_eq!(session.messages[0].text, WELCOME);
    assert_eq!(session.messages[1].role, Role::User);
    assert_eq!(session.messages[1].text, "Hello");
    let reply = &session.messages[2];
    assert_eq!(reply.role, Role::Model);
    assert_eq!(reply.text, "Hi there!");
    assert!(!reply.streaming);
    assert!(!reply.failed);
    assert!(session.updated_at > before.updated_at);

    let events = drain(&mut rx);
    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::ModelDelta { text_delta, .. } => Some(text_delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Hi ", "there!"]);
    assert!(events
        .iter()
        .any(|e| matches!(e, ChatEvent::TitleChanged { title, .. } if title == "Hello")));
    assert!(matches!(events.last(), Some(ChatEvent::TurnCompleted { .. })));
}

#[tokio::test]
async fn test_first_request_has_no_history_and_welcome_is_skipped() {
    let provider = ScriptedProvider::new(vec![
        Reply::Steps(vec![text("First reply")]),
        Reply::Steps(vec![text("Second reply")]),
    ]);
    let (lifecycle, _rx) = sign_in(provider.clone()).await;

    lifecycle.submit("One", Vec::new()).await.unwrap();
    lifecycle.submit("Two", Vec::new()).await.unwrap();

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].contents.len(), 1);
    assert_eq!(requests[0].contents[0].parts, vec![Part::Text("One".into())]);

    let second = &requests[1].contents;
    assert_eq!(second.len(), 3);
    assert_eq!(second[0].role, "user");
    assert_eq!(second[1].role, "model");
    assert_eq!(second[1].parts, vec![Part::Text("First reply".into())]);
    assert_eq!(second[2].parts, vec![Part::Text("Two".into())]);
}

#[tokio::test]
async fn test_long_input_title_is_truncated() {
    let provider = ScriptedProvider::new(vec![
        Reply::Steps(vec![text("ok")]),
        Reply::Steps(vec![text("ok")]),
    ]);
    let (lifecycle, _rx) = sign_in(provider).await;

    let input = "Explain the difference between ownership and borrowing in detail";
    lifecycle.submit(input, Vec::new()).await.unwrap();
    let title = lifecycle.active_session().unwrap().title;
    assert_eq!(title, format!("{}...", &input[..40]));

    // Later turns keep the derived title
    lifecycle.submit("Another question", Vec::new()).await.unwrap();
    assert_eq!(lifecycle.active_session().unwrap().title, title);
}

#[tokio::test]
async fn test_attachment_only_turn() {
    let provider = ScriptedProvider::new(vec![Reply::Steps(vec![text("A cat.")])]);
    let (lifecycle, _rx) = sign_in(provider.clone()).await;

    let attachment = Attachment::new("image/png", vec![0x89u8, 0x50, 0x4e, 0x47]);
    let outcome = lifecycle.submit("", vec![attachment.clone()]).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let session = lifecycle.active_session().unwrap();
    assert_eq!(session.title, "Attachment");
    assert_eq!(session.messages[1].attachments, vec![attachment]);

    let request = &provider.requests()[0];
    assert!(matches!(
        &request.contents[0].parts[..],
        [Part::InlineData(data)] if data.mime_type == "image/png"
    ));
}

#[tokio::test]
async fn test_safety_block_mid_stream_keeps_partial_text() {
    let provider = ScriptedProvider::new(vec![Reply::Steps(vec![
        text("Partial answer"),
        Step::Fail(ProviderError::Blocked("SAFETY".into())),
    ])]);
    let (lifecycle, mut rx) = sign_in(provider.clone()).await;

    let outcome = lifecycle.submit("Tell me something", Vec::new()).await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            category: FailureCategory::SafetyBlock
        }
    );
    assert_eq!(provider.calls(), 1);

    let reply = lifecycle.active_session().unwrap().messages[2].clone();
    let explanation = FailureCategory::SafetyBlock.explanation();
    assert!(reply.text.starts_with("Partial answer"));
    assert!(reply.text.ends_with(explanation));
    assert_eq!(
        reply.text,
        format!("Partial answer{}{}", FAILURE_SEPARATOR, explanation)
    );
    assert!(reply.failed);
    assert!(!reply.streaming);

    let events = drain(&mut rx);
    assert!(matches!(events.last(), Some(ChatEvent::TurnFailed { .. })));
}

#[tokio::test]
async fn test_failure_before_any_text_uses_explanation_only() {
    let provider = ScriptedProvider::new(vec![Reply::OpenError(ProviderError::Api {
        status: 400,
        message: "INVALID_ARGUMENT: API key not valid".into(),
    })]);
    let (lifecycle, _rx) = sign_in(provider.clone()).await;

    let outcome = lifecycle.submit("Hello", Vec::new()).await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            category: FailureCategory::Authentication
        }
    );
    // Permanent failures are not retried
    assert_eq!(provider.calls(), 1);

    let reply = lifecycle.active_session().unwrap().messages[2].clone();
    assert_eq!(reply.text, FailureCategory::Authentication.explanation());
    assert!(reply.failed);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_is_retried_until_success() {
    let rate_limited = || {
        Reply::OpenError(ProviderError::Api {
            status: 429,
            message: "RESOURCE_EXHAUSTED".into(),
        })
    };
    let provider = ScriptedProvider::new(vec![
        rate_limited(),
        rate_limited(),
        Reply::Steps(vec![text("Finally")]),
    ]);
    let (lifecycle, _rx) = sign_in(provider.clone()).await;

    let outcome = lifecycle.submit("Hello", Vec::new()).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);
    assert_eq!(provider.calls(), 3);
    assert_eq!(lifecycle.active_session().unwrap().messages[2].text, "Finally");

    // The identical request was re-issued each time
    let requests = provider.requests();
    assert!(requests.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_exhaustion_fails_turn() {
    let provider = ScriptedProvider::new(
        (0..4)
            .map(|_| {
                Reply::OpenError(ProviderError::Api {
                    status: 429,
                    message: "RESOURCE_EXHAUSTED".into(),
                })
            })
            .collect(),
    );
    let (lifecycle, _rx) = sign_in(provider.clone()).await;

    let outcome = lifecycle.submit("Hello", Vec::new()).await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            category: FailureCategory::RateLimited
        }
    );
    assert_eq!(provider.calls(), 4);
}

#[tokio::test]
async fn test_duplicate_citations_keep_first_title() {
    let provider = ScriptedProvider::new(vec![Reply::Steps(vec![
        Step::Fragment(Fragment {
            text_delta: "According to sources".into(),
            citations: vec![Citation::new("First title", "https://a")],
        }),
        Step::Fragment(Fragment {
            text_delta: ", yes.".into(),
            citations: vec![
                Citation::new("Second title", "https://a"),
                Citation::new("Other", "https://b"),
            ],
        }),
    ])]);
    let (lifecycle, mut rx) = sign_in(provider).await;

    lifecycle.submit("Is it true?", Vec::new()).await.unwrap();

    let reply = lifecycle.active_session().unwrap().messages[2].clone();
    assert_eq!(reply.text, "According to sources, yes.");
    assert_eq!(
        reply.citations,
        vec![
            Citation::new("First title", "https://a"),
            Citation::new("Other", "https://b"),
        ]
    );

    let citation_deltas: Vec<Vec<Citation>> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ChatEvent::ModelDelta { citations, .. } => Some(citations),
            _ => None,
        })
        .collect();
    assert_eq!(citation_deltas[0], vec![Citation::new("First title", "https://a")]);
    assert_eq!(citation_deltas[1], vec![Citation::new("Other", "https://b")]);
}

#[tokio::test]
async fn test_research_mode_enables_search_tool() {
    let provider = ScriptedProvider::new(vec![Reply::Steps(vec![text("ok")])]);
    let (lifecycle, _rx) = sign_in(provider.clone()).await;
    let id = lifecycle.active_session_id().unwrap();

    lifecycle.set_mode(id, Mode::Research).await.unwrap();
    lifecycle.submit("Latest news?", Vec::new()).await.unwrap();

    let request = &provider.requests()[0];
    assert_eq!(request.config.tools, vec![Tool::GoogleSearch]);
    assert_eq!(request.model, "scripted-model");
}

#[tokio::test]
async fn test_empty_submission_is_rejected() {
    let provider = ScriptedProvider::new(Vec::new());
    let (lifecycle, _rx) = sign_in(provider.clone()).await;

    let err = lifecycle.submit("   ", Vec::new()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(lifecycle.active_session().unwrap().messages.len(), 1);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_concurrent_submission_is_rejected() {
    let gate = Arc::new(Notify::new());
    let provider = ScriptedProvider::new(vec![
        Reply::Steps(vec![Step::Wait(gate.clone()), text("Done")]),
        Reply::Steps(vec![text("Second")]),
    ]);
    let (lifecycle, mut rx) = sign_in(provider.clone()).await;
    let lifecycle = Arc::new(lifecycle);
    let id = lifecycle.active_session_id().unwrap();

    let first = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.submit_to(id, "First", Vec::new()).await })
    };
    wait_for(&mut rx, |e| matches!(e, ChatEvent::ModelMessageStarted { .. })).await;

    let err = lifecycle.submit_to(id, "Second", Vec::new()).await.unwrap_err();
    assert!(matches!(err, Error::TurnInProgress(s) if s == id));
    assert_eq!(lifecycle.snapshot(id).unwrap().messages.len(), 3);

    gate.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), TurnOutcome::Completed);

    // Released once the first turn finished
    let outcome = lifecycle.submit_to(id, "Second", Vec::new()).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);
    assert_eq!(lifecycle.snapshot(id).unwrap().messages.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_submission_fails_turn_and_releases_session() {
    let gate = Arc::new(Notify::new());
    let provider = ScriptedProvider::new(vec![
        Reply::Steps(vec![text("Par"), Step::Wait(gate.clone()), text("tial")]),
        Reply::Steps(vec![text("Second answer")]),
    ]);
    let (lifecycle, mut rx) = sign_in(provider).await;
    let id = lifecycle.active_session_id().unwrap();

    let timed_out = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        lifecycle.submit("First", Vec::new()),
    )
    .await;
    assert!(timed_out.is_err());

    let session = lifecycle.snapshot(id).unwrap();
    let reply = &session.messages[2];
    assert!(!reply.streaming);
    assert!(reply.failed);
    assert_eq!(reply.partial_text(), "Par");
    assert!(reply.text.ends_with(FailureCategory::Network.explanation()));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ChatEvent::TurnFailed { session_id, .. } if *session_id == id)));

    let outcome = lifecycle.submit("Second", Vec::new()).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);
    let session = lifecycle.snapshot(id).unwrap();
    assert_eq!(session.messages.len(), 5);
    assert_eq!(session.messages[4].text, "Second answer");
}

#[tokio::test]
async fn test_sessions_stream_independently() {
    let gate = Arc::new(Notify::new());
    let provider = ScriptedProvider::new(vec![
        Reply::Steps(vec![Step::Wait(gate.clone()), text("slow")]),
        Reply::Steps(vec![text("fast")]),
    ]);
    let (lifecycle, mut rx) = sign_in(provider).await;
    let lifecycle = Arc::new(lifecycle);
    let slow_id = lifecycle.active_session_id().unwrap();

    let slow = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.submit_to(slow_id, "Slow", Vec::new()).await })
    };
    wait_for(&mut rx, |e| matches!(e, ChatEvent::ModelMessageStarted { .. })).await;

    let fast_id = lifecycle.create_session().await.unwrap().id;
    let outcome = lifecycle.submit_to(fast_id, "Fast", Vec::new()).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    gate.notify_one();
    assert_eq!(slow.await.unwrap().unwrap(), TurnOutcome::Completed);
    assert_eq!(lifecycle.snapshot(slow_id).unwrap().messages[2].text, "slow");
    assert_eq!(lifecycle.snapshot(fast_id).unwrap().messages[2].text, "fast");
}

#[tokio::test]
async fn test_stale_fragments_are_discarded_after_clear() {
    let gate = Arc::new(Notify::new());
    let provider = ScriptedProvider::new(vec![Reply::Steps(vec![
        text("old "),
        Step::Wait(gate.clone()),
        text("late"),
    ])]);
    let (lifecycle, mut rx) = sign_in(provider).await;
    let lifecycle = Arc::new(lifecycle);
    let id = lifecycle.active_session_id().unwrap();

    let turn = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.submit_to(id, "Question", Vec::new()).await })
    };
    wait_for(&mut rx, |e| matches!(e, ChatEvent::ModelDelta { .. })).await;

    lifecycle.clear_session(id).await.unwrap();
    gate.notify_one();

    assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Discarded);
    let session = lifecycle.snapshot(id).unwrap();
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.messages[0].text, WELCOME);
    assert_eq!(session.title, PLACEHOLDER_TITLE);

    let late_deltas = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ChatEvent::ModelDelta { .. }))
        .count();
    assert_eq!(late_deltas, 0);
}

#[tokio::test]
async fn test_stale_fragments_are_discarded_after_delete() {
    let gate = Arc::new(Notify::new());
    let provider = ScriptedProvider::new(vec![Reply::Steps(vec![
        Step::Wait(gate.clone()),
        text("late"),
    ])]);
    let (lifecycle, mut rx) = sign_in(provider).await;
    let lifecycle = Arc::new(lifecycle);
    let id = lifecycle.active_session_id().unwrap();

    let turn = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.submit_to(id, "Question", Vec::new()).await })
    };
    wait_for(&mut rx, |e| matches!(e, ChatEvent::ModelMessageStarted { .. })).await;

    lifecycle.delete_session(id).await.unwrap();
    gate.notify_one();

    assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Discarded);
    assert!(lifecycle.snapshot(id).is_none());
    assert_eq!(lifecycle.list_sessions().len(), 1);
}
