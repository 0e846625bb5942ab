//! Structured assembly of exchanges and messages.
//!
//! Assembly runs in two steps:
//!
//! 1. [`capture_document`] walks the source top to bottom, one window at a
//!    time, and records every exchange container once (keyed by its stable
//!    content identity) together with its raw markup. Containers whose
//!    thinking was revealed during the sweep contribute the markup read while
//!    the block was open, since recycling collapses it again afterwards.
//! 2. [`assemble_exchanges`] turns the captured containers plus the sweep's
//!    [`RevealedContentMap`] into ordered [`Exchange`]s. It is pure, so the
//!    index invariants can be property-tested without a source.
//!
//! Raw duplicate variants of user and assistant text are kept, each marked
//! with its `duplicate_position`. Collapsing them is left to downstream
//! tooling.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;

use crate::config::{ExtractionConfig, SelectorConfig};
use crate::error::HarvestError;
use crate::identity::container_identity;
use crate::models::{
    Derivation, Exchange, Message, MessageType, RevealedContentMap, StructuredData,
    DERIVATION_VERSION,
};
use crate::traits::ContentSource;

/// One exchange container as read from the source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedExchange {
    pub container_identity: String,
    /// Every rendered user-input variant, in document order.
    pub user_variants: Vec<String>,
    /// Every rendered response variant, in document order.
    pub response_variants: Vec<String>,
}

/// Output of [`capture_document`].
#[derive(Debug, Clone, Default)]
pub struct CapturedDocument {
    pub exchanges: Vec<CapturedExchange>,
    /// Outer markup of each container in document order, newline separated.
    pub raw_snapshot: String,
}

/// Walk the whole source in window-sized steps and capture each exchange
/// container once.
///
/// Handles are only used between two scrolls; containers seen again in a
/// later window are recognized by identity and ignored. `revealed_markup`
/// maps container identities to markup captured while their thinking was
/// open; it replaces the collapsed markup in the snapshot.
pub async fn capture_document(
    source: &dyn ContentSource,
    selectors: &SelectorConfig,
    config: &ExtractionConfig,
    revealed_markup: &HashMap<String, String>,
) -> Result<CapturedDocument> {
    let settle = Duration::from_millis(config.settle_ms);
    let mut seen: HashSet<String> = HashSet::new();
    let mut document = CapturedDocument::default();
    let mut snapshot: Vec<String> = Vec::new();

    source.scroll_to(0).await?;
    tokio::time::sleep(settle).await;

    for _ in 0..config.max_iterations {
        for container in source.query(&selectors.exchange).await? {
            let identity = container_identity(
                source,
                &container,
                selectors,
                config.identity_prefix_chars,
            )
            .await?;
            if identity.is_empty() || !seen.insert(identity.clone()) {
                continue;
            }

            let mut captured = CapturedExchange {
                container_identity: identity,
                ..CapturedExchange::default()
            };
            for node in source
                .query_within(&container, &selectors.user_query)
                .await?
            {
                captured.user_variants.push(source.text(&node).await?);
            }
            for node in source
                .query_within(&container, &selectors.model_response)
                .await?
            {
                captured.response_variants.push(source.text(&node).await?);
            }
            let markup = match revealed_markup.get(&captured.container_identity) {
                Some(markup) => markup.clone(),
                None => source.outer_html(&container).await?,
            };
            snapshot.push(markup);
            document.exchanges.push(captured);
        }

        let vp = source.viewport().await?;
        if vp.offset + vp.window >= vp.extent {
            break;
        }
        source
            .scroll_to((vp.offset + vp.window.max(1)).min(vp.extent))
            .await?;
        tokio::time::sleep(settle).await;
    }

    tracing::debug!(
        exchanges = document.exchanges.len(),
        "document captured"
    );
    document.raw_snapshot = snapshot.join("\n");
    Ok(document)
}

fn push_variants(
    messages: &mut Vec<Message>,
    message_type: MessageType,
    variants: &[String],
) {
    let kept: Vec<&str> = variants
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();
    let duplicated = kept.len() > 1;
    for (position, text) in kept.into_iter().enumerate() {
        let index = messages.len();
        messages.push(Message::text(
            index,
            message_type,
            text.to_string(),
            duplicated.then_some(position),
        ));
    }
}

/// Build ordered exchanges from captured containers and revealed thinking.
///
/// Within an exchange the order is: user variants, thinking (when the
/// container's identity has non-empty stages), response variants. Exchanges
/// with no messages are dropped. Indices are assigned from zero.
pub fn assemble_exchanges(
    captured: &[CapturedExchange],
    revealed: &RevealedContentMap,
) -> Vec<Exchange> {
    let mut exchanges = Vec::new();
    for container in captured {
        let mut messages = Vec::new();
        push_variants(&mut messages, MessageType::UserInput, &container.user_variants);

        if let Some(stages) = revealed.get(&container.container_identity) {
            let stages: Vec<_> = stages
                .iter()
                .filter(|s| !s.name.trim().is_empty() && !s.text.trim().is_empty())
                .cloned()
                .collect();
            if !stages.is_empty() {
                messages.push(Message::thinking(messages.len(), stages));
            }
        }

        push_variants(
            &mut messages,
            MessageType::AssistantResponse,
            &container.response_variants,
        );

        if messages.is_empty() {
            tracing::debug!(
                identity = %container.container_identity,
                "dropping exchange with no messages"
            );
            continue;
        }
        exchanges.push(Exchange {
            exchange_index: exchanges.len(),
            container_identity: container.container_identity.clone(),
            messages,
        });
    }
    exchanges
}

/// Check index contiguity, non-empty exchanges and the thinking-xor-text rule.
pub fn validate_exchanges(exchanges: &[Exchange]) -> Result<(), HarvestError> {
    for (i, exchange) in exchanges.iter().enumerate() {
        if exchange.exchange_index != i {
            return Err(HarvestError::SchemaViolation(format!(
                "exchange at position {i} has index {}",
                exchange.exchange_index
            )));
        }
        if exchange.messages.is_empty() {
            return Err(HarvestError::SchemaViolation(format!(
                "exchange {i} has no messages"
            )));
        }
        for (j, message) in exchange.messages.iter().enumerate() {
            if message.message_index != j {
                return Err(HarvestError::SchemaViolation(format!(
                    "exchange {i}: message at position {j} has index {}",
                    message.message_index
                )));
            }
            if !message.is_well_formed() {
                return Err(HarvestError::SchemaViolation(format!(
                    "exchange {i} message {j}: text/stages do not match type {:?}",
                    message.message_type
                )));
            }
            if message.speaker != message.message_type.speaker() {
                return Err(HarvestError::SchemaViolation(format!(
                    "exchange {i} message {j}: speaker does not match type"
                )));
            }
            if let Some(stages) = &message.stages {
                if stages.is_empty()
                    || stages
                        .iter()
                        .any(|s| s.name.trim().is_empty() || s.text.trim().is_empty())
                {
                    return Err(HarvestError::SchemaViolation(format!(
                        "exchange {i} message {j}: empty thinking stage"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Check the count fields and every exchange invariant of a structured section.
pub fn validate_structured(structured: &StructuredData) -> Result<(), HarvestError> {
    if structured.exchange_count != structured.exchanges.len() {
        return Err(HarvestError::SchemaViolation(format!(
            "exchange_count {} but {} exchanges",
            structured.exchange_count,
            structured.exchanges.len()
        )));
    }
    let messages: usize = structured.exchanges.iter().map(|e| e.messages.len()).sum();
    if structured.message_count != messages {
        return Err(HarvestError::SchemaViolation(format!(
            "message_count {} but {} messages",
            structured.message_count, messages
        )));
    }
    validate_exchanges(&structured.exchanges)
}

/// Wrap validated exchanges into the structured section of a record.
pub fn structure(
    item_id: &str,
    title: &str,
    url: &str,
    exchanges: Vec<Exchange>,
    parsed_at: &str,
) -> Result<StructuredData, HarvestError> {
    validate_exchanges(&exchanges)?;
    let message_count = exchanges.iter().map(|e| e.messages.len()).sum();
    Ok(StructuredData {
        item_id: item_id.to_string(),
        title: title.to_string(),
        url: url.to_string(),
        exchange_count: exchanges.len(),
        message_count,
        exchanges,
        derivation: Derivation {
            source: "raw_snapshot".to_string(),
            version: DERIVATION_VERSION.to_string(),
            parsed_at: parsed_at.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RevelationConfig;
    use crate::extract::SweepExtractor;
    use crate::models::ThinkingStage;
    use crate::replay::{ReplayDocument, ReplaySource, ReplayThinking, ReplayTurn};
    use crate::strategy::StrategySelector;
    use crate::traits::TextFragment;
    use proptest::prelude::*;

    fn stage(name: &str) -> ThinkingStage {
        ThinkingStage {
            name: name.into(),
            text: format!("{name} body"),
        }
    }

    fn fast() -> ExtractionConfig {
        ExtractionConfig {
            poll_attempts: 4,
            poll_interval_ms: 0,
            settle_ms: 0,
            small_step: 50,
            large_step: 200,
            ..ExtractionConfig::default()
        }
    }

    #[test]
    fn duplicates_are_kept_with_positions() {
        let captured = vec![CapturedExchange {
            container_identity: "id".into(),
            user_variants: vec!["hi".into(), " ".into(), "hi".into()],
            response_variants: vec!["hello".into()],
        }];
        let exchanges = assemble_exchanges(&captured, &RevealedContentMap::new());
        let messages = &exchanges[0].messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].duplicate_position, Some(0));
        assert_eq!(messages[1].duplicate_position, Some(1));
        assert_eq!(messages[2].duplicate_position, None);
        assert_eq!(messages[2].message_type, MessageType::AssistantResponse);
    }

    #[test]
    fn thinking_sits_between_user_and_response() {
        let captured = vec![CapturedExchange {
            container_identity: "id".into(),
            user_variants: vec!["q".into()],
            response_variants: vec!["a".into()],
        }];
        let mut revealed = RevealedContentMap::new();
        revealed.insert("id".into(), vec![stage("Planning")]);
        let exchanges = assemble_exchanges(&captured, &revealed);
        let types: Vec<_> = exchanges[0].messages.iter().map(|m| m.message_type).collect();
        assert_eq!(
            types,
            vec![
                MessageType::UserInput,
                MessageType::Thinking,
                MessageType::AssistantResponse
            ]
        );
    }

    #[test]
    fn empty_exchanges_are_dropped_and_indices_stay_gapless() {
        let captured = vec![
            CapturedExchange {
                container_identity: "a".into(),
                user_variants: vec!["one".into()],
                ..Default::default()
            },
            CapturedExchange {
                container_identity: "b".into(),
                user_variants: vec!["   ".into()],
                ..Default::default()
            },
            CapturedExchange {
                container_identity: "c".into(),
                response_variants: vec!["three".into()],
                ..Default::default()
            },
        ];
        let exchanges = assemble_exchanges(&captured, &RevealedContentMap::new());
        assert_eq!(exchanges.len(), 2);
        assert_eq!(exchanges[1].exchange_index, 1);
        assert_eq!(exchanges[1].container_identity, "c");
        validate_exchanges(&exchanges).unwrap();
    }

    #[test]
    fn validation_rejects_index_gaps() {
        let captured = vec![CapturedExchange {
            container_identity: "a".into(),
            user_variants: vec!["one".into()],
            response_variants: vec!["two".into()],
        }];
        let mut exchanges = assemble_exchanges(&captured, &RevealedContentMap::new());
        exchanges[0].messages[1].message_index = 2;
        let err = validate_exchanges(&exchanges).unwrap_err();
        assert_eq!(err.kind(), "schema_violation");
    }

    #[test]
    fn structured_counts_match() {
        let captured = vec![CapturedExchange {
            container_identity: "a".into(),
            user_variants: vec!["one".into()],
            response_variants: vec!["two".into()],
        }];
        let exchanges = assemble_exchanges(&captured, &RevealedContentMap::new());
        let mut structured = structure("abc", "T", "u", exchanges, "now").unwrap();
        assert_eq!(structured.message_count, 2);
        validate_structured(&structured).unwrap();
        structured.message_count = 3;
        assert!(validate_structured(&structured).is_err());
    }

    #[tokio::test]
    async fn three_turns_with_two_stage_thinking_yield_nine_messages() {
        let turns = (0..3)
            .map(|i| ReplayTurn {
                user: vec![format!("user question {i}")],
                responses: vec![format!("assistant answer {i}")],
                thinking: Some(ReplayThinking {
                    fragments: vec![
                        TextFragment::header("Understanding"),
                        TextFragment::plain(format!("Reading question {i} carefully.")),
                        TextFragment::header("Answering"),
                        TextFragment::plain(format!("Composing answer {i} now.")),
                    ],
                    collapsed: true,
                    toggle: true,
                    stubborn: false,
                    reveal_latency: 1,
                }),
                height: None,
            })
            .collect();
        let source = ReplaySource::new(ReplayDocument::for_turns(turns));
        let selectors = SelectorConfig::default();
        let extractor = SweepExtractor::new(fast(), selectors.clone());
        let selection = StrategySelector::from_config(&RevelationConfig::default())
            .unwrap()
            .select(&source, &extractor)
            .await
            .unwrap();

        let captured = capture_document(&source, &selectors, &fast(), &selection.outcome.markup)
            .await
            .unwrap();
        assert_eq!(captured.exchanges.len(), 3);
        assert!(captured.raw_snapshot.contains("user question 2"));

        let exchanges = assemble_exchanges(&captured.exchanges, &selection.outcome.revealed);
        let structured = structure("x", "t", "u", exchanges, "now").unwrap();
        assert_eq!(structured.exchange_count, 3);
        assert_eq!(structured.message_count, 9);
        for exchange in &structured.exchanges {
            assert_eq!(exchange.messages[1].stages.as_ref().unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn capture_walks_past_the_window_without_duplicates() {
        let turns = (0..15)
            .map(|i| ReplayTurn {
                user: vec![format!("prompt {i}"), format!("prompt {i}")],
                responses: vec![format!("reply {i}")],
                thinking: None,
                height: None,
            })
            .collect();
        let mut doc = ReplayDocument::for_turns(turns);
        doc.window = 300;
        doc.overscan = 100;
        let source = ReplaySource::new(doc);
        let captured = capture_document(&source, &SelectorConfig::default(), &fast(), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(captured.exchanges.len(), 15);
        assert_eq!(captured.exchanges[14].user_variants.len(), 2);
        assert!(source.recycle_count() > 0);
    }

    fn reasoning(body: &str) -> ReplayThinking {
        ReplayThinking {
            fragments: vec![
                TextFragment::header("Considering"),
                TextFragment::plain(body.to_string()),
            ],
            collapsed: true,
            toggle: true,
            stubborn: false,
            reveal_latency: 1,
        }
    }

    async fn reveal_and_capture(source: &ReplaySource) -> (CapturedDocument, RevealedContentMap) {
        let selectors = SelectorConfig::default();
        let extractor = SweepExtractor::new(fast(), selectors.clone());
        let selection = StrategySelector::from_config(&RevelationConfig::default())
            .unwrap()
            .select(source, &extractor)
            .await
            .unwrap();
        let captured = capture_document(source, &selectors, &fast(), &selection.outcome.markup)
            .await
            .unwrap();
        (captured, selection.outcome.revealed)
    }

    #[tokio::test]
    async fn repeated_turns_are_kept_apart() {
        let turn = |user: &str, response: &str, body: &str| ReplayTurn {
            user: vec![user.to_string()],
            responses: vec![response.to_string()],
            thinking: Some(reasoning(body)),
            height: None,
        };
        let source = ReplaySource::new(ReplayDocument::for_turns(vec![
            turn("continue", "ok", "Picking up where the story stopped."),
            turn("make it longer", "done", "Expanding the second chapter."),
            turn("continue", "ok", "Moving on to the final chapter."),
        ]));
        let (captured, revealed) = reveal_and_capture(&source).await;

        assert_eq!(captured.exchanges.len(), 3);
        assert_ne!(
            captured.exchanges[0].container_identity,
            captured.exchanges[2].container_identity
        );
        assert_eq!(revealed.len(), 3);

        let exchanges = assemble_exchanges(&captured.exchanges, &revealed);
        let bodies: Vec<&str> = exchanges
            .iter()
            .map(|e| e.messages[1].stages.as_ref().unwrap()[0].text.as_str())
            .collect();
        assert_eq!(
            bodies,
            vec![
                "Picking up where the story stopped.",
                "Expanding the second chapter.",
                "Moving on to the final chapter."
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_keeps_thinking_revealed_before_recycling() {
        let turns = (0..12)
            .map(|i| ReplayTurn {
                user: vec![format!("question number {i}")],
                responses: vec![format!("response number {i}")],
                thinking: Some(reasoning(&format!("Reasoning body for turn {i}."))),
                height: None,
            })
            .collect();
        let mut doc = ReplayDocument::for_turns(turns);
        doc.window = 200;
        doc.overscan = 100;
        let source = ReplaySource::new(doc);
        let (captured, revealed) = reveal_and_capture(&source).await;

        assert!(source.recycle_count() > 0);
        assert_eq!(revealed.len(), 12);
        assert_eq!(captured.exchanges.len(), 12);
        let mut last = 0;
        for i in 0..12 {
            let body = format!("Reasoning body for turn {i}.");
            let at = captured
                .raw_snapshot
                .find(&body)
                .unwrap_or_else(|| panic!("turn {i} thinking missing from snapshot"));
            assert!(at >= last, "turn {i} out of document order");
            last = at;
        }
    }

    fn arb_captured() -> impl Strategy<Value = Vec<CapturedExchange>> {
        let variants = proptest::collection::vec(prop_oneof!["", " ", "[a-z]{1,6}"], 0..4);
        proptest::collection::vec(
            ("[a-z]{1,4}", variants.clone(), variants),
            0..8,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .map(|(id, user, resp)| CapturedExchange {
                    container_identity: id,
                    user_variants: user,
                    response_variants: resp,
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn indices_are_always_contiguous(captured in arb_captured(), with_thinking in any::<bool>()) {
            let mut revealed = RevealedContentMap::new();
            if with_thinking {
                for c in &captured {
                    revealed.insert(c.container_identity.clone(), vec![stage("S")]);
                }
            }
            let exchanges = assemble_exchanges(&captured, &revealed);
            prop_assert!(validate_exchanges(&exchanges).is_ok());
            for (i, e) in exchanges.iter().enumerate() {
                prop_assert_eq!(e.exchange_index, i);
                prop_assert!(!e.messages.is_empty());
                let idx: Vec<usize> = e.messages.iter().map(|m| m.message_index).collect();
                prop_assert_eq!(idx, (0..e.messages.len()).collect::<Vec<_>>());
            }
        }
    }
}
