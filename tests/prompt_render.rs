use translate_bridge::pipeline::{refine, translate, verify};
use translate_bridge::{PresetContext, RefinementRequest, TranslationRequest};

fn base_request() -> TranslationRequest {
    TranslationRequest::new("Please take your medication with food after meals.", "Spanish")
}

#[test]
fn translation_prompt_structured_variant() {
    let mut request = base_request();
    request.preset_context = Some(PresetContext {
        tone: "respectful and warm".to_string(),
        cultural_context: "an elder family member".to_string(),
        custom_instructions: Some("Use the usted form.".to_string()),
    });

    let prompt = translate::system_prompt(&request, true).unwrap();
    assert!(prompt.contains("Spanish"));
    assert!(prompt.contains("respectful and warm"));
    assert!(prompt.contains("an elder family member"));
    assert!(prompt.contains("Use the usted form."));
    assert!(prompt.contains("deliver_translation"));
    // The staged reasoning contract is spelled out in order.
    let intent = prompt.find("communicative intent").unwrap();
    let considerations = prompt.find("cultural considerations").unwrap();
    let strategy = prompt.find("translation strategy").unwrap();
    assert!(intent < considerations && considerations < strategy);
}

#[test]
fn translation_prompt_fallback_variant_lists_labels() {
    let prompt = translate::system_prompt(&base_request(), false).unwrap();
    for label in [
        "INTENT:",
        "CULTURAL_CONSIDERATIONS:",
        "STRATEGY:",
        "TRANSLATION:",
        "CULTURAL_NOTES:",
    ] {
        assert!(prompt.contains(label), "missing label {}", label);
    }
    assert!(!prompt.contains("deliver_translation"));
}

#[test]
fn prompt_override_replaces_the_built_in_prompt() {
    let mut request = base_request();
    request.prompt_override =
        Some("You translate medical text into {TARGET_LANGUAGE} only.".to_string());
    let prompt = translate::system_prompt(&request, true).unwrap();
    assert_eq!(prompt, "You translate medical text into Spanish only.");
}

#[test]
fn prompt_override_without_placeholder_fails() {
    let mut request = base_request();
    request.prompt_override = Some("You translate medical text.".to_string());
    assert!(translate::system_prompt(&request, true).is_err());
}

#[test]
fn verification_prompt_is_blind() {
    let prompt = verify::system_prompt("Spanish").unwrap();
    assert!(prompt.contains("Spanish"));
    assert!(prompt.contains("report_back_translation"));
    // The reviewer is told nothing about the original message.
    assert!(!prompt.to_lowercase().contains("source text"));
    assert!(!prompt.to_lowercase().contains("original message"));
}

#[test]
fn refinement_prompt_embeds_prior_analysis() {
    let request = RefinementRequest {
        source_text: "Please take your medication with food.".to_string(),
        current_translation: "Toma tu medicina con comida.".to_string(),
        target_language: "Spanish".to_string(),
        user_feedback: "make it more formal".to_string(),
        prior_analysis_context: Some("Intent: give a medication instruction.".to_string()),
    };
    let prompt = refine::system_prompt(&request).unwrap();
    assert!(prompt.contains("Spanish"));
    assert!(prompt.contains("Intent: give a medication instruction."));
    assert!(prompt.contains("deliver_refinement"));

    let without = RefinementRequest {
        prior_analysis_context: None,
        ..request
    };
    let prompt = refine::system_prompt(&without).unwrap();
    assert!(!prompt.contains("Intent: give a medication instruction."));
}
