use bevy::{app::ScheduleRunnerPlugin, prelude::*};
use miette::Result;
use tracing_subscriber::EnvFilter;

use vidar::{
    config::{ConfigRoot, VidarConfig, load_config},
    contact::ContactPlugin,
    estimation::EstimationPlugin,
    schedule::ControlSchedulePlugin,
    walking::WalkingControlPlugin,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    miette::set_panic_hook();

    let config_root = ConfigRoot::default();
    let app_config = load_config::<VidarConfig>(&config_root.0, None)?;

    App::new()
        .add_plugins(
            MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(app_config.control_period)),
        )
        .insert_resource(config_root)
        .add_plugins((
            ControlSchedulePlugin {
                period: app_config.control_period.as_secs_f32(),
            },
            EstimationPlugin,
            ContactPlugin,
            WalkingControlPlugin {
                debug_logging: app_config.debug_logging,
            },
        ))
        .run();

    Ok(())
}
