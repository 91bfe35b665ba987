use cerberus_proxy::config::Config;

fn main() {
    let config = serdeconv::to_toml_string(&Config::default()).expect("failed to generate config file");

    println!("{}", config);
}
