//! Request dispatch
//!
//! Maps one IPC [`Request`] onto the session hub and folds the result into a
//! [`Response`]. Connection-scoped requests (subscriptions) are answered by
//! the server before they reach this module.

use std::path::PathBuf;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use tl_core::CoreError;
use tl_protocol::{Request, Response, TerminalSize};
use tl_session::SessionHub;

/// Turn an error into its boundary payload
pub fn error_response(e: CoreError) -> Response {
    Response::Error {
        code: e.code().to_string(),
        message: e.to_string(),
    }
}

fn ok_or_error(result: Result<(), CoreError>) -> Response {
    match result {
        Ok(()) => Response::Ok,
        Err(e) => error_response(e),
    }
}

/// Handle one request against the hub
pub async fn handle_request(
    hub: &SessionHub,
    request: Request,
    shutdown: &CancellationToken,
) -> Response {
    match request {
        Request::Ping => Response::Pong,

        Request::Connect { session_id, params } => {
            match hub.connect(session_id.clone(), params).await {
                Ok(()) => Response::Connected { session_id },
                Err(e) => error_response(e),
            }
        }

        Request::Reconnect { session_id } => match hub.reconnect(&session_id).await {
            Ok(()) => Response::Connected { session_id },
            Err(e) => error_response(e),
        },

        Request::Disconnect { session_id } => {
            hub.disconnect(&session_id).await;
            Response::Ok
        }

        Request::ListSessions => Response::Sessions {
            sessions: hub.list_sessions(),
        },

        Request::Shell { session_id, size } => match hub.shell(&session_id, size).await {
            Ok(channel_id) => Response::Channel { channel_id },
            Err(e) => error_response(e),
        },

        Request::Write { channel_id, data } => {
            ok_or_error(hub.write(&channel_id, Bytes::from(data)).await)
        }

        Request::Resize {
            channel_id,
            cols,
            rows,
        } => ok_or_error(hub.resize(&channel_id, TerminalSize::new(cols, rows)).await),

        Request::CloseChannel { channel_id } => ok_or_error(hub.close_channel(&channel_id)),

        Request::Exec {
            session_id,
            command,
        } => match hub.exec(&session_id, &command).await {
            Ok(output) => Response::ExecOutput {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
            },
            Err(e) => error_response(e),
        },

        Request::ChallengeResponse {
            challenge_id,
            answers,
        } => ok_or_error(hub.respond_challenge(&challenge_id, answers)),

        Request::ChallengeCancel { challenge_id } => {
            ok_or_error(hub.cancel_challenge(&challenge_id))
        }

        Request::SelectionResponse {
            selection_id,
            account_id,
        } => ok_or_error(hub.respond_selection(&selection_id, account_id)),

        Request::SelectionCancel { selection_id } => {
            ok_or_error(hub.cancel_selection(&selection_id))
        }

        Request::SftpList { session_id, path } => match hub.sftp_list(&session_id, &path).await {
            Ok(entries) => Response::Entries { entries },
            Err(e) => error_response(e),
        },

        Request::SftpUploadFile {
            session_id,
            local_path,
            remote_path,
            task_key,
        } => transfer(
            hub.sftp_upload_file(&session_id, &PathBuf::from(local_path), &remote_path, task_key)
                .await,
        ),

        Request::SftpUploadDirectory {
            session_id,
            local_path,
            remote_path,
            task_key,
        } => transfer(
            hub.sftp_upload_directory(
                &session_id,
                &PathBuf::from(local_path),
                &remote_path,
                task_key,
            )
            .await,
        ),

        Request::SftpDownloadFile {
            session_id,
            remote_path,
            local_path,
            task_key,
        } => transfer(
            hub.sftp_download_file(&session_id, &remote_path, &PathBuf::from(local_path), task_key)
                .await,
        ),

        Request::SftpRename {
            session_id,
            from,
            to,
        } => ok_or_error(hub.sftp_rename(&session_id, &from, &to).await),

        Request::SftpDelete { session_id, path } => {
            ok_or_error(hub.sftp_delete(&session_id, &path).await)
        }

        Request::SftpChmod {
            session_id,
            path,
            mode,
            recursive,
        } => ok_or_error(hub.sftp_chmod(&session_id, &path, mode, recursive).await),

        // `available` is false when the task had already finished
        Request::CancelTask { task_key } => Response::Available {
            available: hub.cancel_task(&task_key),
        },

        Request::SftpAvailable { session_id } => Response::Available {
            available: hub.sftp_available(&session_id).await,
        },

        Request::SftpSessions => Response::SessionIds {
            session_ids: hub.sftp_sessions(),
        },

        Request::ConnectLocal { session_id, params } => {
            match hub.connect_local(session_id, params).await {
                Ok((session_id, channel_id)) => Response::LocalConnected {
                    session_id,
                    channel_id,
                },
                Err(e) => error_response(e),
            }
        }

        Request::AvailableShells => Response::Shells {
            shells: hub.available_shells(),
        },

        Request::AgentConfigure { enabled } => ok_or_error(hub.agent_configure(enabled).await),

        Request::AgentAddKey {
            private_key,
            passphrase,
            comment,
        } => match hub
            .agent_add_key(
                private_key.expose(),
                passphrase.as_ref().map(|p| p.expose()),
                comment.as_deref(),
            )
            .await
        {
            Ok(key) => Response::AgentKey { key },
            Err(e) => error_response(e),
        },

        Request::AgentRemoveKey { key_id } => ok_or_error(hub.agent_remove_key(&key_id).await),

        Request::AgentListKeys => match hub.agent_list_keys().await {
            Ok(keys) => Response::AgentKeys { keys },
            Err(e) => error_response(e),
        },

        Request::Subscribe { .. } | Request::Unsubscribe { .. } => Response::Error {
            code: "InvalidRequest".to_string(),
            message: "Subscriptions are bound to a client connection".to_string(),
        },

        Request::Shutdown => {
            tracing::info!("Shutdown requested over IPC");
            shutdown.cancel();
            Response::Ok
        }
    }
}

fn transfer(
    result: Result<(tl_protocol::TaskKey, tl_protocol::TransferOutcome), CoreError>,
) -> Response {
    match result {
        Ok((task_key, outcome)) => Response::Transfer { task_key, outcome },
        Err(e) => error_response(e),
    }
}
