//! Positions the server's working directory, creating missing levels.

use crate::ftp::client::TransferClient;
use crate::ftp::error::FtpResult;

const ROOT_PATH: &str = "/";

/// CWD to `/`, then into each segment in order. A segment the server
/// refuses to enter is created with MKD and entered again. Refusals are
/// not errors here; callers check the reply code afterwards.
pub async fn enter_directory<S: AsRef<str>>(
    client: &mut dyn TransferClient,
    segments: &[S],
) -> FtpResult<()> {
    client.change_working_directory(ROOT_PATH).await?;
    for segment in segments {
        let segment = segment.as_ref();
        if !client.change_working_directory(segment).await? {
            log::debug!("creating missing remote directory '{}'", segment);
            client.make_directory(segment).await?;
            client.change_working_directory(segment).await?;
        }
    }
    Ok(())
}
