use axum::extract::State;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::stager::TempAssetStager;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub stager: Arc<TempAssetStager>,
}

/// Prometheus scrape endpoint. Point-in-time gauges are refreshed before
/// rendering the text exposition format.
pub async fn prometheus_metrics(State(metrics_state): State<MetricsState>) -> String {
    metrics::gauge!("temp_assets_scheduled").set(metrics_state.stager.scheduled_count() as f64);
    metrics_state.handle.render()
}
