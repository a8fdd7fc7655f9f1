pub mod health;
pub mod jobs;
pub mod overview;
pub mod processes;
pub mod queues;
pub mod sets;

use serde::Deserialize;

use crate::error::ApiError;

const DEFAULT_PER_PAGE: usize = 25;
const MAX_PER_PAGE: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

impl PageQuery {
    pub fn resolve(&self) -> Result<(usize, usize), ApiError> {
        let page = self.page.unwrap_or(1);
        let per_page = self.per_page.unwrap_or(DEFAULT_PER_PAGE);
        if page == 0 || per_page == 0 {
            return Err(ApiError::BadRequest(
                "page 与 per_page 必须大于0".to_string(),
            ));
        }
        Ok((page, per_page.min(MAX_PER_PAGE)))
    }
}
