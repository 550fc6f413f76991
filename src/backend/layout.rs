use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::{Profile, Resource, ResourceKind};

/// Where one job's files live on its venue. Both directories are
/// namespaced by job id so concurrent jobs never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    /// Script, version report and scheduler logs
    pub job_dir: PathBuf,
    /// Task input and output files
    pub task_dir: PathBuf,
}

impl JobLayout {
    pub fn new(job_root: &Path, task_root: &Path, job_id: Uuid) -> Self {
        let name = format!("job-{}", job_id.simple());
        Self {
            job_dir: job_root.join(&name),
            task_dir: task_root.join(&name),
        }
    }

    /// Roots for `profile` on `resource`: profile overrides first, then the
    /// impersonated identity's cache directory, then the resource defaults.
    pub fn roots(resource: &Resource, profile: &Profile) -> (PathBuf, PathBuf) {
        let impersonated = resource.kind == ResourceKind::ImpersonatedLocal;
        let job_root = profile
            .job_dir
            .clone()
            .or_else(|| {
                if impersonated {
                    profile.cache_dir.as_ref().map(|d| d.join("jobs"))
                } else {
                    None
                }
            })
            .unwrap_or_else(|| resource.job_root.clone());
        let task_root = profile
            .task_dir
            .clone()
            .or_else(|| {
                if impersonated {
                    None
                } else {
                    resource.task_root.clone()
                }
            })
            .unwrap_or_else(|| job_root.clone());
        (job_root, task_root)
    }

    pub fn for_venue(resource: &Resource, profile: &Profile, job_id: Uuid) -> Self {
        let (job_root, task_root) = Self::roots(resource, profile);
        Self::new(&job_root, &task_root, job_id)
    }

    pub fn input_file(&self, label: &str) -> PathBuf {
        self.task_dir.join(format!("{}.in.json", label))
    }

    pub fn output_file(&self, label: &str) -> PathBuf {
        self.task_dir.join(format!("{}.out.json", label))
    }

    pub fn log_file(&self, label: &str) -> PathBuf {
        self.job_dir.join(format!("{}.log", label))
    }

    pub fn version_file(&self) -> PathBuf {
        self.job_dir.join("version.json")
    }

    pub fn script_file(&self) -> PathBuf {
        self.job_dir.join("job.sh")
    }

    /// Distinct directories, job dir first.
    pub fn dirs(&self) -> Vec<&Path> {
        if self.job_dir == self.task_dir {
            vec![&self.job_dir]
        } else {
            vec![&self.job_dir, &self.task_dir]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_namespaced_per_job() {
        let a = JobLayout::new(Path::new("/jobs"), Path::new("/tasks"), Uuid::new_v4());
        let b = JobLayout::new(Path::new("/jobs"), Path::new("/tasks"), Uuid::new_v4());
        assert_ne!(a.job_dir, b.job_dir);
        assert_ne!(a.input_file("task-0"), b.input_file("task-0"));
        assert!(a.input_file("task-0").starts_with("/tasks"));
        assert!(a.version_file().starts_with("/jobs"));
        assert_eq!(a.dirs().len(), 2);
    }

    #[test]
    fn roots_prefer_profile_overrides() {
        let resource = Resource::local("r", "/srv/jobs");
        let profile = Profile::new("p").with_task_dir("/home/p/tasks");
        let (job_root, task_root) = JobLayout::roots(&resource, &profile);
        assert_eq!(job_root, PathBuf::from("/srv/jobs"));
        assert_eq!(task_root, PathBuf::from("/home/p/tasks"));
    }

    #[test]
    fn impersonated_roots_use_cache_dir() {
        let mut resource =
            Resource::local("r", "/srv/jobs").with_kind(ResourceKind::ImpersonatedLocal);
        resource.task_root = Some(PathBuf::from("/srv/tasks"));
        let profile = Profile::new("p")
            .with_username("alice")
            .with_cache_dir("/home/alice/.cache/taskfold");
        let (job_root, task_root) = JobLayout::roots(&resource, &profile);
        assert_eq!(job_root, PathBuf::from("/home/alice/.cache/taskfold/jobs"));
        assert_eq!(task_root, job_root);
    }

    #[test]
    fn shared_root_yields_one_dir() {
        let layout = JobLayout::new(Path::new("/jobs"), Path::new("/jobs"), Uuid::nil());
        assert_eq!(layout.dirs().len(), 1);
        assert_eq!(
            layout.output_file("t"),
            PathBuf::from(format!("/jobs/job-{}/t.out.json", Uuid::nil().simple()))
        );
    }
}
