use std::env;
use std::fs;
use std::path::Path;

fn main() {
    // Create config template if it doesn't exist
    let out_dir = env::var("OUT_DIR").unwrap_or_else(|_| "./".to_string());
    let template_path = Path::new(&out_dir).join("../../../dvbfan.conf.template");

    let template = r#"# dvbfan configuration template
# Copy this file to 'dvbfan.conf' and adjust the values

autoconfiguration=full
autoconf_radios=0
autoconf_ip4=239.100.%card.%number
unicast=1
ip_http=0.0.0.0
port_http=4242
"#;

    let _ = fs::write(template_path, template);
    println!("cargo:rerun-if-changed=build.rs");
}
