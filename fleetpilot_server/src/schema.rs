diesel::table! {
    teams (id) {
        id -> Integer,
        name -> Text,
        dep_profile_uuid -> Nullable<Text>,
    }
}

diesel::table! {
    team_setup_items (id) {
        id -> Integer,
        team_id -> Integer,           // 0 = hosts without a team
        kind -> Text,                 // profile | account_configuration | bootstrap_package | software | script
        name -> Text,
        payload -> Nullable<Text>,    // profile xml, package url, script body
        source -> Nullable<Text>,     // vpp | package (software only)
        bundle_identifier -> Nullable<Text>,
        version -> Nullable<Text>,
        licenses_available -> Nullable<Integer>,
    }
}

diesel::table! {
    hosts (id) {
        id -> Integer,
        uuid -> Text,
        serial_number -> Text,
        hostname -> Text,
        platform -> Text,             // macos | ios | ipados | windows | linux
        enrollment_method -> Text,    // manual | automatic
        team_id -> Nullable<Integer>,
        mdm_enrolled -> Bool,
        last_checkin -> Nullable<Timestamp>,
        setup_released_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    host_device_actions (host_id) {
        host_id -> Integer,
        device_status -> Text,        // unlocked | locked | wiped
        pending_action -> Text,       // none | lock | unlock | wipe
        unlock_pin -> Nullable<Text>,
        pending_ref -> Nullable<Text>,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    host_commands (id) {
        id -> Integer,
        command_uuid -> Text,
        host_id -> Integer,
        transport -> Text,            // push | pull
        kind -> Text,
        payload -> Text,
        status -> Text,               // pending | delivered | acknowledged | error | canceled
        result -> Nullable<Text>,
        exit_code -> Nullable<Integer>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    host_software_installs (id) {
        id -> Integer,
        install_uuid -> Text,
        host_id -> Integer,
        name -> Text,
        source -> Text,
        bundle_identifier -> Nullable<Text>,
        version -> Nullable<Text>,
        status -> Text,               // pending | verifying | success | failure
        acknowledged_at -> Nullable<Timestamp>,
        verification_command_uuid -> Nullable<Text>,
        detail -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    setup_experience_results (id) {
        id -> Integer,
        host_id -> Integer,
        step -> Text,
        name -> Text,
        status -> Text,               // pending | running | success | failure
        execution_id -> Text,
        setup_item_id -> Nullable<Integer>,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    host_dep_assignments (host_id) {
        host_id -> Integer,
        profile_uuid -> Nullable<Text>,
        assign_profile_response -> Nullable<Text>,
        response_updated_at -> Nullable<Timestamp>,
        retry_job_id -> Nullable<Integer>,
        added_at -> Timestamp,
    }
}

diesel::table! {
    jobs (id) {
        id -> Integer,
        name -> Text,
        args -> Text,
        state -> Text,                // queued | running | failure
        retries -> Integer,
        error -> Nullable<Text>,
        not_before -> Timestamp,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    audit_log (id) {
        id -> Integer,
        actor -> Text,
        action_type -> Text,
        host_id -> Nullable<Integer>,
        target -> Nullable<Text>,
        details -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    server_settings (id) {
        id -> Integer,
        dep_cooldown_seconds -> BigInt,
        verification_timeout_seconds -> BigInt,
        verification_request_delay_seconds -> BigInt,
        schedule_interval_seconds -> BigInt,
        worker_interval_seconds -> BigInt,
        job_max_retries -> Integer,
        stale_job_seconds -> BigInt,
        default_dep_profile_uuid -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    teams,
    team_setup_items,
    hosts,
    host_device_actions,
    host_commands,
    host_software_installs,
    setup_experience_results,
    host_dep_assignments,
    jobs,
    audit_log,
    server_settings,
);
