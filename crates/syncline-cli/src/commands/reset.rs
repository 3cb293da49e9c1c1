use syncline_core::LocalStore;

use crate::error::CliError;

pub fn run_reset(store: &LocalStore, confirmed: bool) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::ResetNotConfirmed);
    }
    store.reset()?;
    println!("Local sync state wiped");
    Ok(())
}
