/// Integration tests with mocked external APIs
/// Exercises the Serper and Viper clients against wiremock servers
use rust_leads_api::credentials::SessionCredentials;
use rust_leads_api::errors::{AppError, EnrichmentError};
use rust_leads_api::services::{
    EnrichmentFetcher, IdentifierResolver, MapsSearch, RegistryLookup, SerperClient, ViperClient,
};
use serde_json::json;
use std::collections::HashMap;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PARTNERS_PATH: &str = "/server/api/infoqualy/consultaCNPJSocios";

fn credentials() -> SessionCredentials {
    SessionCredentials {
        headers: HashMap::from([
            ("cookie".to_string(), "JSESSIONID=abc123".to_string()),
            ("x-csrf-token".to_string(), "csrf-1".to_string()),
        ]),
    }
}

// ============ Serper ============

#[tokio::test]
async fn test_serper_places_are_mapped() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/places"))
        .and(header("X-API-KEY", "test_key"))
        .and(body_partial_json(json!({"q": "advogado em São Paulo - SP", "page": 2, "num": 10})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "places": [
                {"title": "Silva Advogados", "address": "Av. Paulista, 1000", "phoneNumber": "(11) 3000-0000"},
                {"title": "   ", "address": "ignored"},
                {"address": "no title"},
                {"title": "Souza & Lima"}
            ]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = SerperClient::new(mock_server.uri(), "test_key").unwrap();
    let places = client
        .search_places("advogado em São Paulo - SP", 2, 10)
        .await
        .unwrap();

    assert_eq!(places.len(), 2);
    assert_eq!(places[0].name, "Silva Advogados");
    assert_eq!(places[0].address.as_deref(), Some("Av. Paulista, 1000"));
    assert_eq!(places[0].phone.as_deref(), Some("(11) 3000-0000"));
    assert_eq!(places[1].name, "Souza & Lima");
    assert!(places[1].phone.is_none());
}

#[tokio::test]
async fn test_serper_empty_page() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/places"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = SerperClient::new(mock_server.uri(), "test_key").unwrap();
    assert!(client.search_places("nada", 1, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_serper_error_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/places"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
        .mount(&mock_server)
        .await;

    let client = SerperClient::new(mock_server.uri(), "test_key").unwrap();
    let result = client.search_places("advogado", 1, 10).await;

    match result {
        Err(AppError::ExternalApiError(msg)) => assert!(msg.contains("500")),
        other => panic!("expected an external API error, got {:?}", other.map(|p| p.len())),
    }
}

#[tokio::test]
async fn test_resolver_finds_valid_cnpj_and_caches_it() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/search"))
        .and(body_partial_json(json!({"q": "CNPJ Silva Advogados"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "organic": [
                {"title": "Silva Advogados", "snippet": "Telefone (11) 3000-0000"},
                {"title": "CNPJ 11.111.111/1111-11", "snippet": "invalid check digits"},
                {"title": "SILVA ADVOGADOS LTDA", "snippet": "CNPJ: 11.222.333/0001-81 - Ativa"}
            ]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = SerperClient::new(mock_server.uri(), "test_key").unwrap();

    let first = client.resolve_business_id("Silva Advogados").await.unwrap();
    assert_eq!(first.as_deref(), Some("11222333000181"));

    // Differently spelled, same normalized name: served from cache.
    let second = client.resolve_business_id("  SILVA  advogados ").await.unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn test_resolver_without_match() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "organic": [{"title": "Padaria", "snippet": "sem documento"}]
        })))
        .mount(&mock_server)
        .await;

    let client = SerperClient::new(mock_server.uri(), "test_key").unwrap();
    assert_eq!(client.resolve_business_id("Padaria Central").await.unwrap(), None);
    assert_eq!(client.resolve_business_id("   ").await.unwrap(), None);
}

// ============ Viper registry ============

#[tokio::test]
async fn test_viper_company_found() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ws/viperphone/cnpj/11222333000181"))
        .and(header("Authorization", "Basic viper_key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "razao_social": "SILVA ADVOGADOS LTDA",
            "telefones": ["1130000000"]
        })))
        .mount(&mock_server)
        .await;

    let client = ViperClient::new(mock_server.uri(), mock_server.uri(), "viper_key").unwrap();
    let record = client.fetch_company("11222333000181").await.unwrap().unwrap();
    assert_eq!(record["razao_social"], "SILVA ADVOGADOS LTDA");
}

#[tokio::test]
async fn test_viper_missing_records() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ws/viperphone/cnpj/99999999000199"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ws/viperphone/cpf/52998224725"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ws/viperphone/cpf/11144477735"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let client = ViperClient::new(mock_server.uri(), mock_server.uri(), "viper_key").unwrap();
    assert!(client.fetch_company("99999999000199").await.unwrap().is_none());
    assert!(client.fetch_person("52998224725").await.unwrap().is_none());
    assert!(client.fetch_person("11144477735").await.unwrap().is_none());
}

// ============ Viper partners ============

#[tokio::test]
async fn test_partners_sends_session_headers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(PARTNERS_PATH))
        .and(header("cookie", "JSESSIONID=abc123"))
        .and(header("x-csrf-token", "csrf-1"))
        .and(body_partial_json(json!({"CNPJ": "11222333000181"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"NOME": "JOAO SILVA", "CARGO": "SOCIO-ADMINISTRADOR"}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ViperClient::new(mock_server.uri(), mock_server.uri(), "viper_key").unwrap();
    let partners = client
        .fetch_partners("11222333000181", &credentials())
        .await
        .unwrap();
    assert_eq!(partners[0]["NOME"], "JOAO SILVA");
}

#[tokio::test]
async fn test_partners_rejected_session_is_auth_expired() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(PARTNERS_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let client = ViperClient::new(mock_server.uri(), mock_server.uri(), "viper_key").unwrap();
    let result = client.fetch_partners("11222333000181", &credentials()).await;
    assert!(matches!(result, Err(EnrichmentError::AuthExpired)));
}

#[tokio::test]
async fn test_partners_server_error_is_upstream() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(PARTNERS_PATH))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&mock_server)
        .await;

    let client = ViperClient::new(mock_server.uri(), mock_server.uri(), "viper_key").unwrap();
    match client.fetch_partners("11222333000181", &credentials()).await {
        Err(EnrichmentError::Upstream(msg)) => assert!(msg.contains("502")),
        other => panic!("expected upstream error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_partners_without_credentials_makes_no_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(PARTNERS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = ViperClient::new(mock_server.uri(), mock_server.uri(), "viper_key").unwrap();
    let result = client
        .fetch_partners("11222333000181", &SessionCredentials::default())
        .await;
    assert!(matches!(result, Err(EnrichmentError::MissingCredentials)));
}
