use kube::CustomResourceExt;
use klbrd_kubernetes::crd;

fn main() -> Result<(), serde_yaml::Error> {
    print!(
        "{}",
        serde_yaml::to_string(&crd::service::KuberLogicService::crd())?
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&crd::backup::KuberlogicServiceBackup::crd())?
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&crd::restore::KuberlogicServiceRestore::crd())?
    );
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&crd::backup_schedule::KuberlogicServiceBackupSchedule::crd())?
    );
    Ok(())
}
