//! Ruby scripts run on the appliance when no CLI tool covers the job.
//!
//! Placeholders are `{{name}}` and are filled by [`crate::util::render_template`].

/// Loads a YAML document and saves it as the server's settings.
pub(crate) const SET_CONFIG: &str = r#"require 'yaml'
data = YAML.load_file('{{config_file}}')
server = MiqServer.my_server(true)
server.set_config(data)
server.save!
puts "settings applied to server #{server.id}"
"#;

/// Dumps the effective settings as YAML.
pub(crate) const DUMP_CONFIG: &str = r#""File.open('{{dump_file}}', 'w') {|f| f.write(Settings.to_hash.deep_stringify_keys.to_yaml) }""#;

/// Product name as shown in the UI; written to a file to dodge deprecation noise on stdout.
pub(crate) const PRODUCT_NAME: &str = r#""File.open('{{out_file}}', 'w') {|f| f.write(I18n.t('product.name')) }""#;

/// Creates a local region database and points the appliance at it.
pub(crate) const ENABLE_INTERNAL_DB: &str = r#"$LOAD_PATH << '{{miq_lib}}'
require 'appliance_console/database_configuration'
require 'appliance_console/internal_database_configuration'
require 'appliance_console/key_configuration'

key = ApplianceConsole::KeyConfiguration.new
key.ask_questions rescue nil
key.activate || abort('failed to create encryption key')

config = ApplianceConsole::InternalDatabaseConfiguration.new(
  :region   => {{region}},
  :database => 'vmdb_production',
  :username => 'root',
  :password => '{{password}}',
  :interactive => false
)
config.check_disk_is_mount_point rescue nil
config.run_initdb
config.start_postgres
config.create_postgres_root_user
config.create_postgres_database
config.post_activation
config.activate || abort('failed to activate internal database')
system('systemctl enable {{postgres_service}}')
puts 'internal database enabled'
"#;

/// Joins the appliance to a region database on another host.
pub(crate) const ENABLE_EXTERNAL_DB: &str = r#"$LOAD_PATH << '{{miq_lib}}'
require 'appliance_console/database_configuration'
require 'appliance_console/external_database_configuration'

config = ApplianceConsole::ExternalDatabaseConfiguration.new(
  :host     => '{{host}}',
  :region   => {{region}},
  :database => '{{database}}',
  :username => '{{username}}',
  :password => '{{password}}',
  :interactive => false
)
config.activate || abort('failed to join external database {{host}}')
puts 'external database enabled'
"#;
