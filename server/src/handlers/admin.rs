use actix_web::error;
use actix_web::{web, HttpResponse, Result};
use serde::Deserialize;
use tokio::sync::oneshot;

use system::BoardId;

use crate::admin::{AdminCommand, AdminError};
use crate::gateway::{GatewayCommand, GatewayTx};

pub fn configure_admin_handlers(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .service(
                web::resource("/boards")
                    .name("admin_boards")
                    .route(web::get().to(list_boards)),
            )
            .service(
                web::resource("/boards/{board_id}")
                    .name("admin_board")
                    .route(web::get().to(show_board)),
            )
            .service(
                web::resource("/boards/{board_id}/snapshot")
                    .name("admin_board_snapshot")
                    .route(web::post().to(take_snapshot)),
            ),
    );
}

#[derive(Deserialize)]
pub struct BoardParam {
    board_id: String,
}

impl BoardParam {
    fn board_id(&self) -> Result<BoardId> {
        self.board_id
            .parse::<BoardId>()
            .map_err(|_| error::ErrorBadRequest("invalid board id"))
    }
}

async fn ask_gateway<T>(
    gateway_tx: &GatewayTx,
    command: AdminCommand,
    rx: oneshot::Receiver<T>,
) -> Result<T> {
    gateway_tx
        .send(GatewayCommand::Admin(command))
        .await
        .map_err(|_| error::ErrorInternalServerError("Internal Server Error"))?;
    rx.await
        .map_err(|_| error::ErrorInternalServerError("Receiver await error"))
}

fn admin_error(err: AdminError) -> actix_web::Error {
    match err {
        AdminError::BoardOffline(_) => error::ErrorNotFound(err.to_string()),
        AdminError::RoomGone(_) => error::ErrorServiceUnavailable(err.to_string()),
        AdminError::Persistence(_) => error::ErrorInternalServerError(err.to_string()),
    }
}

pub async fn list_boards(gateway_tx: web::Data<GatewayTx>) -> Result<HttpResponse> {
    let (tx, rx) = oneshot::channel();
    let boards = ask_gateway(gateway_tx.get_ref(), AdminCommand::ListBoards { tx }, rx).await?;
    Ok(HttpResponse::Ok().json(boards))
}

pub async fn show_board(
    path: web::Path<BoardParam>,
    gateway_tx: web::Data<GatewayTx>,
) -> Result<HttpResponse> {
    let board_id = path.board_id()?;
    let (tx, rx) = oneshot::channel();
    let description = ask_gateway(
        gateway_tx.get_ref(),
        AdminCommand::DescribeBoard { board_id, tx },
        rx,
    )
    .await?
    .map_err(admin_error)?;
    Ok(HttpResponse::Ok().json(description))
}

pub async fn take_snapshot(
    path: web::Path<BoardParam>,
    gateway_tx: web::Data<GatewayTx>,
) -> Result<HttpResponse> {
    let board_id = path.board_id()?;
    let (tx, rx) = oneshot::channel();
    let meta = ask_gateway(
        gateway_tx.get_ref(),
        AdminCommand::TakeSnapshot { board_id, tx },
        rx,
    )
    .await?
    .map_err(admin_error)?;
    log::info!("Manual snapshot {} of board {} taken", meta.version, board_id);
    Ok(HttpResponse::Created().json(meta))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::http::StatusCode;
    use actix_web::test::{call_service, init_service, read_body_json, TestRequest};
    use actix_web::App;

    use super::*;
    use crate::authz::AllowAll;
    use crate::config::Config;
    use crate::gateway::spawn_gateway;
    use crate::snapshot_store::MemorySnapshotStore;

    #[actix_web::test]
    async fn it_refuses_malformed_board_ids() {
        let (gateway_tx, _rx) = tokio::sync::mpsc::channel::<GatewayCommand>(1);
        let app = init_service(
            App::new()
                .app_data(web::Data::new(gateway_tx))
                .configure(configure_admin_handlers),
        )
        .await;
        let req = TestRequest::get().uri("/admin/boards/not-a-uuid").to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn it_lists_boards_and_reports_offline_snapshots() {
        let gateway_tx = spawn_gateway(
            Config::default(),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(AllowAll),
        );
        let app = init_service(
            App::new()
                .app_data(web::Data::new(gateway_tx))
                .configure(configure_admin_handlers),
        )
        .await;

        let resp = call_service(&app, TestRequest::get().uri("/admin/boards").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let boards: system::serde_json::Value = read_body_json(resp).await;
        assert_eq!(boards, system::serde_json::json!([]));

        let uri = format!("/admin/boards/{}/snapshot", system::uuid::Uuid::new_v4());
        let resp = call_service(&app, TestRequest::post().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
