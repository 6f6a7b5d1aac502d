use crate::{
    pages,
    services::{
        credential_store::CredentialStore,
        network::NetworkProvisioner,
        provisioning::{ConnectForm, CredentialSubmitted, ProvisioningService, SubmitError},
        status::StatusBoard,
    },
};
use actix_web::{
    HttpRequest, HttpResponse, HttpResponseBuilder, Responder,
    http::header::{self, ContentType},
    web,
};
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::mpsc;

const UNKNOWN_DEVICE_CODE: &str = "UNKNOWN";

/// Provisioning portal served on the setup access point
pub struct Api<Store, Provisioner> {
    pub store: Arc<Store>,
    pub provisioner: Arc<Provisioner>,
    pub status: StatusBoard,
    pub submissions: mpsc::Sender<CredentialSubmitted>,
    pub dashboard_url: String,
}

impl<Store, Provisioner> Clone for Api<Store, Provisioner> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            provisioner: self.provisioner.clone(),
            status: self.status.clone(),
            submissions: self.submissions.clone(),
            dashboard_url: self.dashboard_url.clone(),
        }
    }
}

impl<Store, Provisioner> Api<Store, Provisioner>
where
    Store: CredentialStore + Send + Sync + 'static,
    Provisioner: NetworkProvisioner + Send + Sync + 'static,
{
    /// Register the portal routes
    ///
    /// Unknown paths redirect to the setup page so captive portal probes
    /// open it.
    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg.route("/", web::get().to(Self::index))
            .route("/connect", web::post().to(Self::connect))
            .route("/status", web::get().to(Self::status))
            .default_service(web::route().to(Self::captive_redirect));
    }

    pub async fn index(api: web::Data<Self>) -> impl Responder {
        debug!("index() called");

        html(HttpResponse::Ok(), pages::setup_page(&api.network_list().await, None))
    }

    pub async fn connect(api: web::Data<Self>, form: web::Form<ConnectForm>) -> impl Responder {
        debug!("connect() called");

        let form = form.into_inner();
        let ssid = form.ssid.clone();

        match ProvisioningService::submit(api.store.as_ref(), &api.status, &api.submissions, form)
        {
            Ok(()) => html(
                HttpResponse::Ok(),
                pages::connecting_page(
                    &ssid,
                    api.status.device_code().unwrap_or(UNKNOWN_DEVICE_CODE),
                    &api.dashboard_url,
                ),
            ),
            Err(SubmitError::Invalid(reason)) => html(
                HttpResponse::BadRequest(),
                pages::setup_page(&api.network_list().await, Some(&reason)),
            ),
            Err(SubmitError::PortalClosed) => {
                info!("credential for {ssid} submitted while provisioning is inactive");
                html(
                    HttpResponse::ServiceUnavailable(),
                    pages::message_page(
                        "Setup not active",
                        "PaperDrop is not accepting network settings right now.",
                    ),
                )
            }
            Err(e) => {
                error!("connect failed: {e}");
                html(
                    HttpResponse::InternalServerError(),
                    pages::message_page("Something went wrong", "Could not save network settings."),
                )
            }
        }
    }

    pub async fn status(api: web::Data<Self>) -> impl Responder {
        HttpResponse::Ok().json(api.status.snapshot())
    }

    pub async fn captive_redirect(req: HttpRequest) -> impl Responder {
        info!("captive portal probe: {}", req.path());

        HttpResponse::Found()
            .insert_header((header::LOCATION, "/"))
            .finish()
    }

    async fn network_list(&self) -> String {
        match self.provisioner.scan_networks().await {
            Ok(networks) => pages::network_list(&networks),
            Err(e) => {
                error!("scan failed: {e:#}");
                pages::SCAN_FAILED.to_string()
            }
        }
    }
}

fn html(mut builder: HttpResponseBuilder, body: String) -> HttpResponse {
    builder.content_type(ContentType::html()).body(body)
}
