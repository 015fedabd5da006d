use sa_domain::config::Config;

#[test]
fn default_server_host_is_unspecified() {
    std::env::remove_var("SA_GATEWAY_HOST");
    std::env::remove_var("SA_GATEWAY_PORT");
    let config = Config::load_or_default();
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 8080);
}

#[test]
fn server_host_and_port_read_from_env() {
    std::env::set_var("SA_GATEWAY_HOST", "127.0.0.1");
    std::env::set_var("SA_GATEWAY_PORT", "3210");
    let config = Config::load_or_default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 3210);
    std::env::remove_var("SA_GATEWAY_HOST");
    std::env::remove_var("SA_GATEWAY_PORT");
}
