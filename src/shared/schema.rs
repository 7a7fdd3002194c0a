diesel::table! {
    tenants (id) {
        id -> Uuid,
        slug -> Text,
        settings -> Jsonb,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        email -> Text,
        role -> Text,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tenant_configs (tenant_id) {
        tenant_id -> Uuid,
        embedding_provider -> Text,
        embedding_model -> Text,
        embedding_dimensions -> Int4,
        embedding_base_url -> Nullable<Text>,
        chat_provider -> Text,
        chat_model -> Text,
        chat_base_url -> Nullable<Text>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    documents (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        user_id -> Uuid,
        filename -> Text,
        file_path -> Text,
        file_size -> Int8,
        file_type -> Text,
        status -> Text,
        content -> Nullable<Text>,
        chunk_count -> Int4,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    document_chunks (id) {
        id -> Uuid,
        document_id -> Uuid,
        tenant_id -> Uuid,
        chunk_index -> Int4,
        content -> Text,
        token_count -> Int4,
        start_char -> Nullable<Int4>,
        end_char -> Nullable<Int4>,
        metadata -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    llm_operations (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        user_id -> Uuid,
        document_id -> Nullable<Uuid>,
        operation_type -> Text,
        input_data -> Jsonb,
        output_data -> Nullable<Jsonb>,
        model_used -> Nullable<Text>,
        tokens_used -> Nullable<Int4>,
        cost_estimate -> Nullable<Float8>,
        status -> Text,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    conversation_sessions (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        user_id -> Uuid,
        workflow_id -> Nullable<Uuid>,
        thread_id -> Text,
        title -> Text,
        mode -> Text,
        metadata -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    messages (id) {
        id -> Uuid,
        session_id -> Uuid,
        role -> Text,
        content -> Text,
        metadata -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    session_documents (id) {
        id -> Uuid,
        session_id -> Uuid,
        document_id -> Uuid,
        added_at -> Timestamptz,
        is_active -> Bool,
    }
}

diesel::table! {
    workflow_definitions (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        name -> Text,
        version -> Text,
        description -> Nullable<Text>,
        nodes -> Jsonb,
        edges -> Jsonb,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    workflow_executions (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        user_id -> Uuid,
        workflow_id -> Nullable<Uuid>,
        session_id -> Uuid,
        thread_id -> Text,
        status -> Text,
        input_data -> Jsonb,
        output_data -> Nullable<Jsonb>,
        error_message -> Nullable<Text>,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    checkpoints (id) {
        id -> Uuid,
        thread_id -> Text,
        step -> Int4,
        state_blob -> Jsonb,
        parent_step -> Nullable<Int4>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    hitl_approvals (id) {
        id -> Uuid,
        execution_id -> Uuid,
        tenant_id -> Uuid,
        user_id -> Uuid,
        prompt -> Text,
        context_data -> Jsonb,
        status -> Text,
        user_response -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        responded_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(document_chunks -> documents (document_id));
diesel::joinable!(messages -> conversation_sessions (session_id));
diesel::joinable!(session_documents -> conversation_sessions (session_id));
diesel::joinable!(session_documents -> documents (document_id));
diesel::joinable!(hitl_approvals -> workflow_executions (execution_id));

diesel::allow_tables_to_appear_in_same_query!(
    tenants,
    users,
    tenant_configs,
    documents,
    document_chunks,
    llm_operations,
    conversation_sessions,
    messages,
    session_documents,
    workflow_definitions,
    workflow_executions,
    checkpoints,
    hitl_approvals,
);
