use async_trait::async_trait;
use harvest_core::{HarvestError, Result, coordinator::{JobContext, JobHandler}};
use tracing::info;

/// Handler registered for controllers that have no integration plugged in
/// yet. It checks the scan window carried by the payload and reports it.
#[derive(Debug, Clone)]
pub struct LoggingJobHandler {
    controller_name: String,
}

impl LoggingJobHandler {
    pub fn new(controller_name: impl Into<String>) -> Self {
        Self {
            controller_name: controller_name.into(),
        }
    }
}

#[async_trait]
impl JobHandler for LoggingJobHandler {
    async fn run(&self, ctx: JobContext) -> Result<()> {
        let Some(scan) = ctx.scan.as_ref() else {
            info!(
                controller = %self.controller_name,
                instance = %ctx.instance_id(),
                attempt = ctx.instance.attempt_count + 1,
                "running unscheduled job"
            );
            return Ok(());
        };

        let field = |name: &str| {
            ctx.instance
                .payload
                .get(name)
                .and_then(|value| value.as_str())
                .ok_or_else(|| {
                    HarvestError::InvalidState(format!(
                        "scan job {} has no `{name}` in its payload",
                        ctx.instance_id()
                    ))
                })
        };
        let from = field("from")?;
        let to = field("to")?;

        info!(
            controller = %self.controller_name,
            instance = %ctx.instance_id(),
            scan_type = %scan.scan_type,
            partial = scan.partial,
            historical = scan.historical,
            from,
            to,
            "running scan"
        );
        Ok(())
    }
}
