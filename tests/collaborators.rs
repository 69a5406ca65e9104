//! HTTP collaborator tests against mock servers

use harken::agent::{ChatResponder, Exchange, Responder};
use harken::config::{ApiKeys, SttProvider, TtsProvider};
use harken::voice::{
    EndReason, Frame, SpeechToText, Synthesizer, TextToSpeech, Transcriber, Utterance,
    samples_to_wav,
};
use harken::{Config, Error};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;

fn keys() -> ApiKeys {
    ApiKeys {
        openai: Some("sk-test".to_string()),
        deepgram: Some("dg-test".to_string()),
        elevenlabs: Some("el-test".to_string()),
    }
}

fn utterance() -> Utterance {
    let frames = (0..10).map(common::speech_frame).collect::<Vec<Frame>>();
    Utterance::new(frames, common::spec(), EndReason::EndOfSpeech)
}

#[tokio::test]
async fn whisper_transcript_is_trimmed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/transcriptions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "text": "  turn on the lights \n" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default().stt;
    config.base_url = Some(server.uri());
    let stt = SpeechToText::from_config(&config, &keys()).unwrap();

    let transcript = stt.transcribe(&utterance()).await.unwrap();
    assert_eq!(transcript, "turn on the lights");
}

#[tokio::test]
async fn deepgram_sends_model_and_language() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/listen"))
        .and(query_param("model", "nova-2"))
        .and(query_param("language", "es"))
        .and(header("authorization", "Token dg-test"))
        .and(header("content-type", "audio/wav"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": {
                "channels": [{ "alternatives": [{ "transcript": "enciende la luz" }] }]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default().stt;
    config.provider = SttProvider::Deepgram;
    config.model = "nova-2".to_string();
    config.language = Some("es".to_string());
    config.base_url = Some(server.uri());
    let stt = SpeechToText::from_config(&config, &keys()).unwrap();

    assert_eq!(stt.transcribe(&utterance()).await.unwrap(), "enciende la luz");
}

#[tokio::test]
async fn transcription_server_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let stt = SpeechToText::new_whisper("sk-test".to_string(), "whisper-1".to_string())
        .unwrap()
        .with_base_url(&server.uri());

    let err = stt.transcribe(&utterance()).await.unwrap_err();
    assert!(matches!(err, Error::Stt(ref message) if message.contains("503")));
    assert!(!err.is_config());
}

#[test]
fn missing_api_keys_are_configuration_errors() {
    let config = Config::default();
    let none = ApiKeys::default();

    assert!(
        SpeechToText::from_config(&config.stt, &none)
            .err()
            .is_some_and(|e| e.is_config())
    );
    assert!(
        TextToSpeech::from_config(&config.tts, &none)
            .err()
            .is_some_and(|e| e.is_config())
    );
}

#[tokio::test]
async fn chat_request_carries_history_and_settings() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "gpt-4o-mini",
            "max_tokens": 256
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": " Noon again. " } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default().llm;
    config.base_url = server.uri();
    let responder = ChatResponder::from_config(&config, &keys());

    let history = vec![Exchange {
        user: "what time is it".to_string(),
        assistant: "noon".to_string(),
    }];
    let reply = responder.respond("and tomorrow?", &history).await.unwrap();
    assert_eq!(reply, "Noon again.");

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let messages: Vec<(&str, &str)> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| (m["role"].as_str().unwrap(), m["content"].as_str().unwrap()))
        .collect();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].0, "system");
    assert_eq!(messages[1], ("user", "what time is it"));
    assert_eq!(messages[2], ("assistant", "noon"));
    assert_eq!(messages[3], ("user", "and tomorrow?"));
}

#[tokio::test]
async fn chat_without_key_sends_no_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": "local reply" } }]
        })))
        .mount(&server)
        .await;

    let mut config = Config::default().llm;
    config.base_url = format!("{}/", server.uri());
    let responder = ChatResponder::new(config, None);

    assert_eq!(responder.respond("hi", &[]).await.unwrap(), "local reply");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn chat_error_status_is_a_responder_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let mut config = Config::default().llm;
    config.base_url = server.uri();
    let responder = ChatResponder::new(config, Some("sk-wrong".to_string()));

    let err = responder.respond("hi", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Responder(ref message) if message.contains("401")));
}

#[tokio::test]
async fn openai_speech_wav_is_decoded() {
    let wav = samples_to_wav(&vec![1_000i16; 24_000], 24_000).unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "tts-1",
            "voice": "alloy",
            "input": "hello there"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(wav, "audio/wav"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default().tts;
    config.base_url = Some(server.uri());
    let tts = TextToSpeech::from_config(&config, &keys()).unwrap();

    let clip = tts.synthesize("hello there").await.unwrap();
    assert_eq!(clip.sample_rate, 24_000);
    assert_eq!(clip.samples.len(), 24_000);
    assert_eq!(clip.duration(), std::time::Duration::from_secs(1));
}

#[tokio::test]
async fn elevenlabs_uses_voice_path_and_default_model() {
    let wav = samples_to_wav(&vec![0i16; 1_600], 16_000).unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/text-to-speech/rachel"))
        .and(header("xi-api-key", "el-test"))
        .and(body_partial_json(serde_json::json!({
            "text": "hola",
            "model_id": "eleven_monolingual_v1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(wav, "audio/wav"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default().tts;
    config.provider = TtsProvider::ElevenLabs;
    config.voice = "rachel".to_string();
    config.base_url = Some(server.uri());
    let tts = TextToSpeech::from_config(&config, &keys()).unwrap();

    let clip = tts.synthesize("hola").await.unwrap();
    assert_eq!(clip.samples.len(), 1_600);
}

#[tokio::test]
async fn undecodable_speech_is_a_tts_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"not audio".to_vec(), "audio/mpeg"))
        .mount(&server)
        .await;

    let tts = TextToSpeech::new_openai(
        "sk-test".to_string(),
        "alloy".to_string(),
        1.0,
        "tts-1".to_string(),
    )
    .unwrap()
    .with_base_url(&server.uri());

    let err = tts.synthesize("hello").await.unwrap_err();
    assert!(matches!(err, Error::Tts(_)));
}
