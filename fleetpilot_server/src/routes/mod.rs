use rocket::{routes, Route};

pub mod actions;
pub mod agent;
pub mod history;
pub mod hosts;
pub mod mdm;
pub mod settings;
pub mod setup_experience;
pub mod teams;

/// Administrator routes
pub fn api_routes() -> Vec<Route> {
    routes![
        // Hosts
        hosts::enroll_host,
        hosts::get_host,
        hosts::delete_host,
        hosts::transfer_host,

        // Device actions
        actions::lock_host,
        actions::unlock_host,
        actions::wipe_host,
        actions::device_status,

        // Activities
        history::host_activities,

        // Setup experience
        setup_experience::host_setup_experience,
        setup_experience::cancel_setup_step,

        // Teams
        teams::create_team,
        teams::add_setup_item,
        teams::set_dep_profile,

        // Settings
        settings::view_settings,
        settings::update_settings,
    ]
}

/// MDM protocol routes, called by devices
pub fn mdm_routes() -> Vec<Route> {
    routes![mdm::fetch_commands, mdm::post_results]
}

/// Agent routes, called by the on-device agent
pub fn agent_routes() -> Vec<Route> {
    routes![
        agent::fetch_commands,
        agent::setup_experience_status,
        agent::script_result,
        agent::software_result,
    ]
}
