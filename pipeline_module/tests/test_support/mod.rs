#![allow(dead_code)]

pub fn require_service_bus_connection(test_name: &str) -> Option<String> {
    dotenvy::dotenv().ok();
    match std::env::var("SERVICE_BUS_CONNECTION_STRING") {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            eprintln!("Skipping {test_name}; SERVICE_BUS_CONNECTION_STRING not set.");
            None
        }
    }
}

pub fn start_mockito_server(test_name: &str) -> Option<mockito::ServerGuard> {
    let server = std::panic::catch_unwind(|| mockito::Server::new());
    match server {
        Ok(server) => Some(server),
        Err(_) => {
            eprintln!(
                "Skipping {test_name}; unable to start mockito server in this environment."
            );
            None
        }
    }
}
